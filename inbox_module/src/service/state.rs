use crate::ingest::IngestService;

/// Shared by every request handler.
#[derive(Clone, Debug)]
pub struct GatewayState {
    pub(super) ingest: IngestService,
}

impl GatewayState {
    pub fn new(ingest: IngestService) -> Self {
        Self { ingest }
    }

    pub fn ingest(&self) -> &IngestService {
        &self.ingest
    }
}
