use std::sync::Arc;

use directory_module::DirectoryClient;

use crate::service::ServiceConfig;
use crate::work_queue::WorkQueue;

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) config: Arc<ServiceConfig>,
    pub(super) directory: Arc<dyn DirectoryClient>,
    pub(super) queue: Arc<dyn WorkQueue>,
}
