//! lanshare - share a folder with every device on the local network.
//!
//! The crate is organised around a directory-backed [`store::FileStore`]:
//! uploads, deletes, and listings go through it, every committed change is
//! fanned out to connected viewers by the [`notifier::ChangeNotifier`], and the
//! [`archive::ArchiveBuilder`] streams the whole store as one ZIP. The
//! [`discovery`] responder lets clients find the server without typing an
//! address, and [`server`] puts an HTTP API in front of all of it.

pub mod archive;
pub mod config;
pub mod discovery;
pub mod logging;
pub mod notifier;
pub mod server;
pub mod store;
