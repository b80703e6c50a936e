//! HTTP front-end of the compile server.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Browser │ ───────> │  server.rs  (build_router, start_server)         │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ ProgressChannel::serve()               │
//!                       │         v                                        │
//!                       │  ws.rs  (keepalive, admission, progress frames)  │
//!                       │         │                                        │
//!                       │         │ BuildCache::get_or_build()             │
//!                       │         v                                        │
//!                       │  cache.rs  (single-flight fetch/compile/store)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! | Module     | Responsibility                                            |
//! |------------|-----------------------------------------------------------|
//! | `api`      | Routes, `AppState`, JSON errors, page and artifact views  |
//! | `ws`       | `ProgressChannel`: one websocket per build request        |
//! | `embedded` | Static assets via `rust-embed`, gzipped once at startup   |
//! | `server`   | Router assembly, listener and graceful shutdown           |

pub mod api;
pub mod embedded;
pub mod server;
pub mod ws;
