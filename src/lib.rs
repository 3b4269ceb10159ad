//! # Hub Core - Pluggable Automation Kernel
//!
//! A small kernel that hosts independently loadable plugins and lets them
//! cooperate only through two channels:
//! - a **service registry** of named request/response endpoints
//! - an **event bus** with exact and prefix-wildcard topic subscriptions
//!
//! Around those sit a plugin lifecycle manager, a write-through state mirror
//! over a pluggable storage adapter, and an auth subsystem (API keys,
//! sessions, signed bearer tokens, rate limiting, revocation, audit) that
//! guards every externally triggered call.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────────────────────────────┐
//!   external call  →   │ Runtime                              │
//!   (credential)       │  ┌──────┐   ┌──────────┐  ┌───────┐  │
//!                      │  │ Auth │ → │ Services │  │  Bus  │  │
//!                      │  └──────┘   └──────────┘  └───────┘  │
//!                      │       ↑ register / call / publish ↑  │
//!                      │  ┌────────────────────────────────┐  │
//!                      │  │ Plugin Manager → plugins       │  │
//!                      │  └────────────────────────────────┘  │
//!                      │  ┌─────────────┐   ┌─────────────┐   │
//!                      │  │ StateMirror │ → │  Storage    │   │
//!                      │  └─────────────┘   └─────────────┘   │
//!                      └──────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod builtin;
pub mod bus;
pub mod kernel;
pub mod plugin;
pub mod state;
pub mod storage;
pub mod types;

// Internal utilities
pub mod observability;

pub use kernel::Runtime;
pub use types::{Config, Error, ErrorKind, Result};
