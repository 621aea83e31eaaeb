use crate::session::{BrowseReference, UaSession};
use dashmap::DashSet;
use futures::{
    future::{join_all, BoxFuture},
    FutureExt,
};
use ng_gateway_sdk::{DriverError, DriverResult};
use opcua::types::{ByteString, NodeId};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Called for every reference found, with the browse names from the root
/// down to and including the reference's own name.
pub type Visitor<'a> = &'a (dyn Fn(&BrowseReference, &[String]) + Send + Sync);

/// `FolderType`; only references with this type definition are descended into.
#[inline]
pub fn folder_type() -> NodeId {
    NodeId::new(0, 61u32)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    Completed,
    Cancelled,
}

enum Stop {
    Cancelled,
    Failed(DriverError),
}

/// One cancellable depth-first walk of the address space below `root`.
///
/// Sibling folders are browsed concurrently and each folder at most once, so
/// cyclic folder references terminate. Cancellation is observed around
/// every server call; a branch that stops while holding a continuation point
/// releases it before returning.
pub struct TreeVisit {
    root: NodeId,
    cancel: CancellationToken,
}

impl TreeVisit {
    pub fn new(root: NodeId) -> Self {
        Self::with_token(root, CancellationToken::new())
    }

    pub fn with_token(root: NodeId, cancel: CancellationToken) -> Self {
        Self { root, cancel }
    }

    #[inline]
    pub fn root(&self) -> &NodeId {
        &self.root
    }

    #[inline]
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[inline]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn run(
        &self,
        session: &dyn UaSession,
        visitor: Visitor<'_>,
    ) -> DriverResult<VisitOutcome> {
        if self.is_cancelled() {
            return Ok(VisitOutcome::Cancelled);
        }
        let visited = DashSet::new();
        visited.insert(self.root.clone());
        match self
            .visit(session, &visited, self.root.clone(), Vec::new(), visitor)
            .await
        {
            Ok(()) if self.is_cancelled() => Ok(VisitOutcome::Cancelled),
            Ok(()) => Ok(VisitOutcome::Completed),
            Err(Stop::Cancelled) => Ok(VisitOutcome::Cancelled),
            Err(Stop::Failed(e)) => Err(e),
        }
    }

    fn visit<'a>(
        &'a self,
        session: &'a dyn UaSession,
        visited: &'a DashSet<NodeId>,
        node: NodeId,
        path: Vec<String>,
        visitor: Visitor<'a>,
    ) -> BoxFuture<'a, Result<(), Stop>> {
        async move {
            let references = self.browse_all(session, &node).await?;
            let mut folders = Vec::new();
            for reference in &references {
                if self.is_cancelled() {
                    return Err(Stop::Cancelled);
                }
                let mut child_path = path.clone();
                child_path.push(reference.browse_name.name.as_ref().to_string());
                visitor(reference, &child_path);
                if reference.type_definition.as_ref() == Some(&folder_type()) {
                    match &reference.node_id {
                        Some(child) if visited.insert(child.clone()) => {
                            folders.push((child.clone(), child_path));
                        }
                        _ => {}
                    }
                }
            }

            let results = join_all(
                folders
                    .into_iter()
                    .map(|(child, child_path)| self.visit(session, visited, child, child_path, visitor)),
            )
            .await;

            // A failure outranks a cancellation.
            let mut outcome = Ok(());
            for result in results {
                match result {
                    Err(Stop::Failed(e)) => return Err(Stop::Failed(e)),
                    Err(Stop::Cancelled) => outcome = Err(Stop::Cancelled),
                    Ok(()) => {}
                }
            }
            outcome
        }
        .boxed()
    }

    /// Browse `node` and follow continuation points until the last page.
    async fn browse_all(
        &self,
        session: &dyn UaSession,
        node: &NodeId,
    ) -> Result<Vec<BrowseReference>, Stop> {
        let mut page = match self.guarded(session.browse(node)).await {
            None => return Err(Stop::Cancelled),
            Some(result) => result.map_err(|status| {
                Stop::Failed(DriverError::BrowseError(format!("browse {node}: {status}")))
            })?,
        };
        let mut references = std::mem::take(&mut page.references);

        while let Some(continuation_point) = page.continuation_point.take().filter(|cp| !cp.is_null()) {
            if self.is_cancelled() {
                release(session, continuation_point).await;
                return Err(Stop::Cancelled);
            }
            page = match self
                .guarded(session.browse_next(continuation_point.clone(), false))
                .await
            {
                None => {
                    release(session, continuation_point).await;
                    return Err(Stop::Cancelled);
                }
                Some(result) => result.map_err(|status| {
                    Stop::Failed(DriverError::BrowseError(format!(
                        "browse next under {node}: {status}"
                    )))
                })?,
            };
            references.append(&mut page.references);
        }
        Ok(references)
    }

    /// Await `fut` unless the visit is cancelled first.
    async fn guarded<F: Future>(&self, fut: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            out = fut => Some(out),
        }
    }
}

async fn release(session: &dyn UaSession, continuation_point: ByteString) {
    if let Err(status) = session.browse_next(continuation_point, true).await {
        tracing::debug!(%status, "releasing browse continuation point failed");
    }
}
