//! # Brass Console Adapter
//!
//! A reference adapter that turns terminal input into message events and
//! prints replies. Useful for trying plugins without a chat platform.
//!
//! ```rust,ignore
//! use brass_adapter_console::ConsoleAdapter;
//! use brass_runtime::BrassRuntime;
//!
//! let runtime = BrassRuntime::new();
//! runtime.register_adapter::<ConsoleAdapter>().await?;
//! runtime.run().await?;
//! ```
//!
//! Each non-empty line is emitted as a `message.private` event in a single
//! conversation (`console` unless configured otherwise); the only supported
//! outbound action is `send_message`.

pub mod adapter;
pub mod config;

pub use adapter::{BoxedReader, BoxedWriter, ConsoleAdapter, MESSAGE_EVENT};
pub use config::ConsoleConfig;
