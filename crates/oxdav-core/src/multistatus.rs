//! In-memory model of a `207 Multi-Status` body.
//!
//! Built by the handlers, rendered by [`crate::xml::render_multistatus`].

use crate::path::CanonicalPath;
use crate::props::{PropName, PropStatus, PropValue};
use http::StatusCode;

/// Properties sharing one status inside a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropStat {
    pub status: StatusCode,
    pub props: Vec<(PropName, PropValue)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Whole-resource status (batch failures).
    Status(StatusCode),
    /// Per-property statuses (PROPFIND, PROPPATCH).
    PropStats(Vec<PropStat>),
}

/// One `<D:response>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusResponse {
    pub path: CanonicalPath,
    pub collection: bool,
    pub outcome: ResponseOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiStatus {
    pub responses: Vec<StatusResponse>,
}

impl MultiStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    pub fn push_status(&mut self, path: CanonicalPath, collection: bool, status: StatusCode) {
        self.responses.push(StatusResponse {
            path,
            collection,
            outcome: ResponseOutcome::Status(status),
        });
    }

    /// Add a property listing, grouping properties by status. Found
    /// properties come first, failures follow in ascending status order.
    pub fn push_props(&mut self, path: CanonicalPath, collection: bool, props: Vec<PropStatus>) {
        let mut stats: Vec<PropStat> = Vec::new();
        for PropStatus { name, outcome } in props {
            let (status, value) = match outcome {
                Ok(value) => (StatusCode::OK, value),
                Err(status) => (status, PropValue::Empty),
            };
            match stats.iter_mut().find(|s| s.status == status) {
                Some(stat) => stat.props.push((name, value)),
                None => stats.push(PropStat {
                    status,
                    props: vec![(name, value)],
                }),
            }
        }
        stats.sort_by_key(|s| s.status.as_u16());
        self.responses.push(StatusResponse {
            path,
            collection,
            outcome: ResponseOutcome::PropStats(stats),
        });
    }

    /// Add PROPPATCH results (one status per property name).
    pub fn push_patch_results(
        &mut self,
        path: CanonicalPath,
        collection: bool,
        results: Vec<(PropName, StatusCode)>,
    ) {
        let props = results
            .into_iter()
            .map(|(name, status)| PropStatus {
                name,
                outcome: if status.is_success() {
                    Ok(PropValue::Empty)
                } else {
                    Err(status)
                },
            })
            .collect();
        self.push_props(path, collection, props);
    }
}
