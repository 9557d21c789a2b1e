use std::sync::Arc;

use crate::{
    admission::AdmissionController,
    blob::{BlobError, BlobUploader},
    extractor::Extractor,
    jobs::JobQueue,
    settings::Settings,
};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub admission: AdmissionController,
    pub extractor: Arc<Extractor>,
    pub uploader: Option<Arc<BlobUploader>>,
    pub jobs: JobQueue,
}

impl AppState {
    /// Wires the shared services. An unusable blob connection string is
    /// reported here so the process refuses to start with it.
    pub fn new(
        settings: Settings,
        http_client: reqwest::Client,
        jobs: JobQueue,
    ) -> Result<Self, BlobError> {
        let uploader = BlobUploader::from_settings(&settings.blob, http_client)?.map(Arc::new);
        Ok(Self {
            admission: AdmissionController::new(settings.max_concurrent_downloads),
            extractor: Arc::new(Extractor::from_settings(&settings)),
            uploader,
            jobs,
            settings: Arc::new(settings),
        })
    }
}
