use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{Blob, Hash, Tree};

/// The content-addressed object store the checkout consumes.
///
/// This is an external collaborator: the overlay core only ever reads from
/// it. Failures surface as errors on the returned futures.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_tree(&self, hash: &Hash) -> Result<Arc<Tree>>;

    async fn get_blob(&self, hash: &Hash) -> Result<Arc<Blob>>;
}
