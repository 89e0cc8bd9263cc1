//! # sfb-sftp
//!
//! Remote-session and file-transfer core:
//!   • Single active SFTP session with password / key authentication
//!   • FIFO-serialised access to the session (optional per-transfer sub-channels)
//!   • Path-based directory listing
//!   • Concurrent, cancellable, chunked downloads and uploads
//!   • Token-keyed progress / terminal event stream

pub mod sftp;
