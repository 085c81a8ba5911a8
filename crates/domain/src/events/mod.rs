//! 通道事件
//!
//! 服务端推送与客户端上行事件都以带标签的联合类型表示，
//! 线上格式为 `{"event": "<name>", "data": {...}}`。

pub mod channel_event;

pub use channel_event::*;
