//! Strato Engine - the open-file and chunk-I/O core
//!
//! Exposes remote object backends as an ordinary file surface: reads and
//! writes are chunked, cached on local disk, optionally encrypted, and
//! uploaded asynchronously. The mount glue (FUSE/WinFsp) talks to
//! [`FileManager`]; backends implement [`Provider`].

pub mod chunk;
pub mod encryption;
pub mod events;
pub mod file_manager;
pub mod file_table;
pub mod local;
pub mod meta;
pub mod open_file;
pub mod provider;
pub mod upload;

pub use chunk::{select_download_type, ChunkEngine};
pub use encryption::{EncryptingReader, ItemReader};
pub use events::{CollectingSink, EventSink, EventSinkPtr, FsEvent, LogSink};
pub use file_manager::FileManager;
pub use file_table::OpenFileTable;
pub use local::LocalProvider;
pub use meta::{MetaStore, ResumeRecord, UploadRecord};
pub use open_file::OpenFile;
pub use provider::{Provider, ProviderPtr};
pub use upload::{UploadCallback, UploadManager};
