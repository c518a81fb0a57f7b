use ravel_proto::v1::{Member, ResponseHeader};
use ravel_storage::Membership;
use ravel_types::{EngineError, RavelError};
use tonic::metadata::MetadataValue;
use tonic::Status;

pub const LEADER_ADDR_KEY: &str = "ravel-leader-addr";

pub fn header(node_id: &str, applied_index: Option<u64>) -> ResponseHeader {
    ResponseHeader {
        node_id: node_id.to_string(),
        applied_index: applied_index.unwrap_or(0),
    }
}

pub fn members_to_proto(membership: &Membership) -> Vec<Member> {
    membership
        .voters
        .iter()
        .map(|(id, address)| Member { id: id.clone(), address: address.clone() })
        .collect()
}

pub fn ravel_to_status(err: RavelError) -> Status {
    match &err {
        RavelError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        RavelError::RequestTimedOut(_) => Status::deadline_exceeded(err.to_string()),
        RavelError::EngineRejected(rejection) => engine_to_status(rejection),
        RavelError::Decode(_) | RavelError::Restore(_) | RavelError::Storage(_) => {
            Status::internal(err.to_string())
        }
    }
}

fn engine_to_status(err: &EngineError) -> Status {
    match err {
        EngineError::NotLeader { leader } => {
            let mut status = Status::unavailable(err.to_string());
            if let Some(addr) = leader {
                if let Ok(val) = MetadataValue::try_from(addr.as_str()) {
                    status.metadata_mut().insert(LEADER_ADDR_KEY, val);
                }
            }
            status
        }
        EngineError::NoQuorum | EngineError::ShuttingDown | EngineError::Halted => {
            Status::unavailable(err.to_string())
        }
        EngineError::EnqueueTimeout => Status::resource_exhausted(err.to_string()),
        EngineError::SnapshotInProgress | EngineError::NothingToSnapshot => {
            Status::failed_precondition(err.to_string())
        }
        EngineError::Storage(_) => Status::internal(err.to_string()),
        EngineError::ApplyFailed { .. } => Status::unknown(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tonic::Code;

    use super::*;

    #[test]
    fn not_leader_carries_hint() {
        let status = ravel_to_status(RavelError::EngineRejected(EngineError::NotLeader {
            leader: Some("10.0.0.2:17000".into()),
        }));
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(
            status.metadata().get(LEADER_ADDR_KEY).and_then(|v| v.to_str().ok()),
            Some("10.0.0.2:17000")
        );

        let status = ravel_to_status(EngineError::NotLeader { leader: None }.into());
        assert!(status.metadata().get(LEADER_ADDR_KEY).is_none());
    }

    #[test]
    fn codes_by_kind() {
        let cases = [
            (RavelError::RequestTimedOut(Duration::from_secs(1)), Code::DeadlineExceeded),
            (RavelError::InvalidArgument("x".into()), Code::InvalidArgument),
            (RavelError::Storage("disk".into()), Code::Internal),
            (EngineError::EnqueueTimeout.into(), Code::ResourceExhausted),
            (EngineError::NoQuorum.into(), Code::Unavailable),
            (EngineError::Halted.into(), Code::Unavailable),
            (EngineError::NothingToSnapshot.into(), Code::FailedPrecondition),
            (EngineError::SnapshotInProgress.into(), Code::FailedPrecondition),
            (EngineError::ApplyFailed { index: 3 }.into(), Code::Unknown),
        ];
        for (err, code) in cases {
            let msg = err.to_string();
            assert_eq!(ravel_to_status(err).code(), code, "{msg}");
        }
    }

    #[test]
    fn timeout_message_says_outcome_unknown() {
        let status = ravel_to_status(RavelError::RequestTimedOut(Duration::from_millis(500)));
        assert!(status.message().contains("may still be applied"));
    }
}
