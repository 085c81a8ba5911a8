//! 实时同步层核心领域模型
//!
//! 包含标识符、消息状态以及通道上流动的事件类型。

pub mod errors;
pub mod events;
pub mod message_status;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use events::*;
pub use message_status::*;
pub use value_objects::*;
