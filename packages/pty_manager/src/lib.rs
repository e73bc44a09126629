//! PTY Manager - process-backed terminal sessions
//!
//! Spawns a shell attached to a pseudo-terminal and exposes it as a plain
//! async byte stream: a lazy sequence of output chunks, a write path for
//! input, and an idempotent close. It knows nothing about networking.
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use pty_manager::{PtyConfig, PtySession};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (session, mut output) = PtySession::spawn(PtyConfig::default()).unwrap();
//!
//!     session.write(b"echo hello\n").await.unwrap();
//!
//!     while let Some(chunk) = output.next().await {
//!         print!("{}", String::from_utf8_lossy(&chunk));
//!     }
//!
//!     session.close().await;
//! }
//! ```

mod error;
pub mod pty;

pub use error::PtyError;
pub use pty::{PtyConfig, PtyOutput, PtySession, default_shell};
