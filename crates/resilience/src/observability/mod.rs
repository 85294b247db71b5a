//! Event stream and hooks for policy decisions
//!
//! Every call through a chain produces a [`PolicyEvent::Call`]; every breaker
//! transition produces a [`PolicyEvent::StateChanged`]. Events go to the
//! [`EventBus`] and to each registered [`ObservabilityHook`].

pub mod bus;
pub mod event;
pub mod hooks;

pub use bus::EventBus;
pub use event::{CallEvent, PolicyEvent};
pub use hooks::{LogLevel, LoggingHook, MetricsHook, ObservabilityHook, ObservabilityHooks};
