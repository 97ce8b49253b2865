use failure::{bail, format_err};

use crate::proto::{Response, ZkError};
use crate::{error, Stat};

pub(crate) fn create(
    res: Result<Response, ZkError>,
) -> Result<Result<String, error::Create>, failure::Error> {
    match res {
        Ok(Response::String(s)) => Ok(Ok(s)),
        Ok(r) => bail!("got non-string response to create: {:?}", r),
        Err(ZkError::NoNode) => Ok(Err(error::Create::NoNode)),
        Err(ZkError::NodeExists) => Ok(Err(error::Create::NodeExists)),
        Err(ZkError::InvalidACL) => Ok(Err(error::Create::InvalidAcl)),
        Err(ZkError::NoChildrenForEphemerals) => Ok(Err(error::Create::NoChildrenForEphemerals)),
        Err(e) => Err(format_err!("create call failed: {}", e)),
    }
}

pub(crate) fn delete(
    version: i32,
    res: Result<Response, ZkError>,
) -> Result<Result<(), error::Delete>, failure::Error> {
    match res {
        Ok(Response::Empty) => Ok(Ok(())),
        Ok(r) => bail!("got non-empty response to delete: {:?}", r),
        Err(ZkError::NoNode) => Ok(Err(error::Delete::NoNode)),
        Err(ZkError::NotEmpty) => Ok(Err(error::Delete::NotEmpty)),
        Err(ZkError::BadVersion) => Ok(Err(error::Delete::BadVersion { expected: version })),
        Err(e) => Err(format_err!("delete call failed: {}", e)),
    }
}

/// Unlike the other transforms, every server status maps onto `error::GetChildren`: a refresh
/// result must always be reportable with a status code.
pub(crate) fn get_children(
    res: Result<Response, ZkError>,
) -> Result<Result<(Vec<String>, Stat), error::GetChildren>, failure::Error> {
    match res {
        Ok(Response::Children { children, stat }) => Ok(Ok((children, stat))),
        Ok(r) => bail!("got non-children response to get-children: {:?}", r),
        Err(ZkError::NoNode) => Ok(Err(error::GetChildren::NoNode)),
        Err(ZkError::NoAuth) => Ok(Err(error::GetChildren::NoAuth)),
        Err(ZkError::ConnectionLoss) => Ok(Err(error::GetChildren::ConnectionLoss)),
        Err(ZkError::SessionExpired) => Ok(Err(error::GetChildren::SessionExpired)),
        Err(e) => Ok(Err(error::GetChildren::Internal(e))),
    }
}

pub(crate) fn close(res: Result<Response, ZkError>) -> Result<(), failure::Error> {
    match res {
        Ok(Response::Empty) => Ok(()),
        // the server has already forgotten the session
        Err(ZkError::SessionExpired) => Ok(()),
        Ok(r) => bail!("got non-empty response to close: {:?}", r),
        Err(e) => Err(format_err!("close call failed: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_children_maps_session_errors() {
        assert_eq!(
            get_children(Err(ZkError::ConnectionLoss)).unwrap(),
            Err(error::GetChildren::ConnectionLoss)
        );
        assert_eq!(
            get_children(Err(ZkError::MarshallingError)).unwrap(),
            Err(error::GetChildren::Internal(ZkError::MarshallingError))
        );
        assert!(get_children(Ok(Response::Empty)).is_err());
    }

    #[test]
    fn create_keeps_unexpected_errors_outside() {
        assert_eq!(
            create(Err(ZkError::NodeExists)).unwrap(),
            Err(error::Create::NodeExists)
        );
        assert!(create(Err(ZkError::SessionExpired)).is_err());
    }

    #[test]
    fn delete_reports_expected_version() {
        assert_eq!(
            delete(3, Err(ZkError::BadVersion)).unwrap(),
            Err(error::Delete::BadVersion { expected: 3 })
        );
    }
}
