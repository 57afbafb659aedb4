//! Dispatch engine (C8): resolves a servant for an incoming request and
//! turns its outcome into a wire-ready [`ReplyBody`], guaranteeing a reply
//! is produced exactly once per two-way request regardless of how dispatch
//! fails.

use bytes::Bytes;
use pylon_proto::{encode_identity_triple, Identity, ReplyBody, ReplyStatus};

use crate::adapter::{Current, DispatchResult, ObjectAdapter};

/// Stateless entry point for invoking a resolved servant and mapping the
/// outcome to a reply. Holds no state of its own — everything it needs
/// (servant table, locators) lives on the [`ObjectAdapter`] it's given.
pub struct DispatchEngine;

impl DispatchEngine {
    /// Dispatch one request against `adapter`. Returns `None` for one-way
    /// requests (`current.request_id == 0`), since no reply is ever sent
    /// for those; returns `Some(reply)` otherwise, even on failure.
    pub async fn dispatch(adapter: &ObjectAdapter, current: Current, params: Bytes) -> Option<ReplyBody> {
        let request_id = current.request_id;
        let twoway = current.is_twoway();

        if !adapter.can_dispatch() {
            let err = crate::error::AdapterError::NotActive(adapter.name().to_string());
            return twoway.then(|| reply_for_not_exist(request_id, err));
        }

        let resolved = adapter.servant_manager().resolve(&current);
        let (servant, locator) = match resolved {
            Ok(pair) => pair,
            Err(err) => {
                return twoway.then(|| reply_for_not_exist(request_id, err));
            },
        };

        let outcome = servant.dispatch(current.clone(), params).await;

        if let Some((locator, cookie)) = locator {
            locator.finished(&current, &servant, cookie);
        }

        if !twoway {
            return None;
        }

        Some(match outcome {
            Ok(DispatchResult::Ok(payload)) => ReplyBody { request_id, status: ReplyStatus::Ok, payload },
            Ok(DispatchResult::UserException(payload)) => {
                ReplyBody { request_id, status: ReplyStatus::UserException, payload }
            },
            Err(err) => reply_for_dispatch_error(request_id, err),
        })
    }
}

fn reply_for_adapter_not_active(request_id: i32) -> ReplyBody {
    ReplyBody {
        request_id,
        status: ReplyStatus::UnknownLocal,
        payload: Bytes::from("object adapter is not active"),
    }
}

pub(crate) fn reply_for_not_exist(request_id: i32, err: crate::error::AdapterError) -> ReplyBody {
    match err {
        crate::error::AdapterError::ObjectNotExist { category, name, facet, operation } => ReplyBody {
            request_id,
            status: ReplyStatus::ObjectNotExist,
            payload: encode_identity_triple(&Identity { category, name }, facet.as_deref(), &operation),
        },
        crate::error::AdapterError::FacetNotExist { category, name, facet, operation } => ReplyBody {
            request_id,
            status: ReplyStatus::FacetNotExist,
            payload: encode_identity_triple(&Identity { category, name }, facet.as_deref(), &operation),
        },
        crate::error::AdapterError::NotActive(_) | crate::error::AdapterError::AlreadyRegistered(_) => {
            reply_for_adapter_not_active(request_id)
        },
    }
}

fn reply_for_dispatch_error(request_id: i32, err: crate::error::DispatchError) -> ReplyBody {
    match err {
        crate::error::DispatchError::OperationNotExist { category, name, operation } => ReplyBody {
            request_id,
            status: ReplyStatus::OperationNotExist,
            payload: encode_identity_triple(&Identity { category, name }, None, &operation),
        },
        crate::error::DispatchError::UnknownUserException(msg) => {
            ReplyBody { request_id, status: ReplyStatus::UnknownUser, payload: Bytes::from(msg) }
        },
        crate::error::DispatchError::UnknownLocalException(msg) => {
            ReplyBody { request_id, status: ReplyStatus::UnknownLocal, payload: Bytes::from(msg) }
        },
    }
}
