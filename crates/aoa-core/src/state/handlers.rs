//! Transition handlers.
//!
//! Each handler inspects and updates the `LinkContext` and reports what the
//! connection has to do next. Platform calls and event delivery happen in
//! the connection; handlers stay free of I/O.

use tracing::{debug, warn};

use crate::events::InboundEvent;
use crate::identity::{AccessoryDescriptor, AccessoryIdentity};
use crate::state::machine::{ConnectionState, LinkContext, OpenSession, Phase};

/// Outcome of a discovery pass during `start`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StartAction {
    /// Report an event, no transition.
    Emit(InboundEvent),
    /// Permission is held: open the accessory.
    Open(AccessoryDescriptor),
    /// Now `PermissionPending`: ask the platform for access.
    RequestPermission(AccessoryDescriptor),
    /// A request is already in flight.
    AwaitPermission,
}

/// Outcome of a permission notification.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PermissionAction {
    Ignore,
    Open(AccessoryDescriptor),
    Emit(InboundEvent),
}

/// Outcome of a detach notification.
pub(crate) enum DetachAction {
    Ignore,
    /// Now `Closed`; release the session if there was one, then report.
    Close(Option<OpenSession>),
}

/// Decide what `start` does with the discovery result. Only called in
/// `Idle` or `PermissionPending`.
pub(crate) fn handle_discovery(
    ctx: &mut LinkContext,
    identity: &AccessoryIdentity,
    found: Option<AccessoryDescriptor>,
    permitted: impl FnOnce(&AccessoryDescriptor) -> bool,
) -> StartAction {
    let Some(accessory) = found else {
        debug!("No accessory attached");
        return StartAction::Emit(InboundEvent::NotConnected);
    };

    if let Some(field) = identity.first_mismatch(&accessory) {
        warn!(
            field = %field,
            expected = identity.get(field),
            found = accessory.get(field),
            "Accessory identity mismatch"
        );
        return StartAction::Emit(InboundEvent::identity_mismatch(field));
    }

    if permitted(&accessory) {
        return StartAction::Open(accessory);
    }

    if ctx.state() == ConnectionState::PermissionPending {
        debug!("Permission request already pending");
        return StartAction::AwaitPermission;
    }

    ctx.goto(Phase::PermissionPending {
        accessory: accessory.clone(),
    });
    StartAction::RequestPermission(accessory)
}

/// The platform could not even issue the permission request.
pub(crate) fn handle_request_failed(ctx: &mut LinkContext) {
    if ctx.state() == ConnectionState::PermissionPending {
        ctx.goto(Phase::Idle);
    }
}

pub(crate) fn handle_permission_result(ctx: &mut LinkContext, granted: bool) -> PermissionAction {
    let Phase::PermissionPending { accessory } = ctx.phase() else {
        debug!(granted, state = %ctx.state(), "Unsolicited permission result ignored");
        return PermissionAction::Ignore;
    };

    if granted {
        PermissionAction::Open(accessory.clone())
    } else {
        ctx.goto(Phase::Idle);
        PermissionAction::Emit(InboundEvent::PermissionDenied)
    }
}

pub(crate) fn handle_detached(ctx: &mut LinkContext) -> DetachAction {
    match ctx.state() {
        ConnectionState::PermissionPending | ConnectionState::Open => {
            DetachAction::Close(ctx.take_session(Phase::Closed))
        }
        ConnectionState::Idle | ConnectionState::Closed => {
            debug!(state = %ctx.state(), "Detach ignored");
            DetachAction::Ignore
        }
    }
}

pub(crate) fn handle_stop(ctx: &mut LinkContext) -> Option<OpenSession> {
    ctx.take_session(Phase::Closed)
}

/// A read of the session opened at `epoch` failed. Returns the session to
/// release if it was still the open one.
pub(crate) fn handle_read_failure(ctx: &mut LinkContext, epoch: u64) -> Option<OpenSession> {
    if !ctx.is_open_epoch(epoch) {
        return None;
    }
    ctx.take_session(Phase::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityField;
    use crate::platform::{AccessoryPlatform, MockPlatform};

    fn identity() -> AccessoryIdentity {
        AccessoryIdentity::new("Acme", "Widget", "1.0").unwrap()
    }

    fn widget() -> AccessoryDescriptor {
        AccessoryDescriptor::new("Acme", "Widget", "1.0")
    }

    #[test]
    fn test_nothing_found() {
        let mut ctx = LinkContext::new();
        let action = handle_discovery(&mut ctx, &identity(), None, |_| true);
        assert_eq!(action, StartAction::Emit(InboundEvent::NotConnected));
        assert_eq!(ctx.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_mismatch_skips_permission_check() {
        let mut ctx = LinkContext::new();
        let found = AccessoryDescriptor::new("Acme", "Widget", "2.0");
        let action = handle_discovery(&mut ctx, &identity(), Some(found), |_| {
            panic!("permission must not be checked for a foreign accessory")
        });
        assert_eq!(
            action,
            StartAction::Emit(InboundEvent::IdentityMismatch {
                field: IdentityField::Version,
                reason: "Version is not matched!".into(),
            })
        );
        assert_eq!(ctx.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_permission_request_guard() {
        let mut ctx = LinkContext::new();
        let first = handle_discovery(&mut ctx, &identity(), Some(widget()), |_| false);
        assert_eq!(first, StartAction::RequestPermission(widget()));
        assert_eq!(ctx.state(), ConnectionState::PermissionPending);

        let second = handle_discovery(&mut ctx, &identity(), Some(widget()), |_| false);
        assert_eq!(second, StartAction::AwaitPermission);
    }

    #[test]
    fn test_permission_results() {
        let mut ctx = LinkContext::new();
        assert_eq!(
            handle_permission_result(&mut ctx, true),
            PermissionAction::Ignore
        );

        handle_discovery(&mut ctx, &identity(), Some(widget()), |_| false);
        assert_eq!(
            handle_permission_result(&mut ctx, true),
            PermissionAction::Open(widget())
        );

        assert_eq!(
            handle_permission_result(&mut ctx, false),
            PermissionAction::Emit(InboundEvent::PermissionDenied)
        );
        assert_eq!(ctx.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_request_failure_returns_to_idle() {
        let mut ctx = LinkContext::new();
        handle_discovery(&mut ctx, &identity(), Some(widget()), |_| false);
        handle_request_failed(&mut ctx);
        assert_eq!(ctx.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_detach_states() {
        let mut ctx = LinkContext::new();
        assert!(matches!(handle_detached(&mut ctx), DetachAction::Ignore));

        handle_discovery(&mut ctx, &identity(), Some(widget()), |_| false);
        assert!(matches!(
            handle_detached(&mut ctx),
            DetachAction::Close(None)
        ));
        assert_eq!(ctx.state(), ConnectionState::Closed);
        assert!(matches!(handle_detached(&mut ctx), DetachAction::Ignore));
    }

    #[test]
    fn test_stale_read_failure_ignored() {
        let mock = MockPlatform::new();
        let mut ctx = LinkContext::new();
        let epoch = ctx.enter_open(widget(), mock.open(&widget()).unwrap());

        assert!(handle_read_failure(&mut ctx, epoch + 1).is_none());
        assert_eq!(ctx.state(), ConnectionState::Open);

        let session = handle_read_failure(&mut ctx, epoch).unwrap();
        session.streams.release();
        assert_eq!(ctx.state(), ConnectionState::Closed);
        assert!(handle_stop(&mut ctx).is_none());
    }
}
