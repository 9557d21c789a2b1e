//! HTTP service that extracts audio tracks with `yt-dlp`, optionally pushes
//! them to Azure Blob Storage, and serves the produced files until the
//! retention sweeper removes them.

pub mod admission;
pub mod blob;
pub mod download;
pub mod error;
pub mod extractor;
pub mod files;
pub mod jobs;
pub mod routes;
pub mod settings;
pub mod state;
pub mod sweeper;

pub use routes::build_router;
pub use settings::Settings;
pub use state::AppState;
