//! Controller session tracking

use crate::error::{AssetError, AssetResult};
use parking_lot::Mutex;
use std::net::IpAddr;
use tracing::info;

/// The remote controller currently subscribed to this device
#[derive(Debug)]
pub struct Session {
    required: bool,
    controller: Mutex<Option<IpAddr>>,
}

impl Session {
    /// `required` gates start-asset and signal requests on a subscription
    pub fn new(required: bool) -> Self {
        Self {
            required,
            controller: Mutex::new(None),
        }
    }

    pub fn subscribe(&self, controller: IpAddr) {
        let previous = self.controller.lock().replace(controller);
        match previous {
            Some(old) if old != controller => {
                info!("Controller {} replaced {}", controller, old)
            }
            Some(_) => info!("Controller {} re-subscribed", controller),
            None => info!("Controller {} subscribed", controller),
        }
    }

    /// Clear the session; returns the controller that was subscribed
    pub fn unsubscribe(&self) -> Option<IpAddr> {
        let previous = self.controller.lock().take();
        if let Some(controller) = previous {
            info!("Controller {} unsubscribed", controller);
        }
        previous
    }

    pub fn controller(&self) -> Option<IpAddr> {
        *self.controller.lock()
    }

    pub fn is_subscribed(&self) -> bool {
        self.controller.lock().is_some()
    }

    pub fn ensure_subscribed(&self) -> AssetResult<()> {
        if self.required && !self.is_subscribed() {
            return Err(AssetError::NotSubscribed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_required_session_gates_until_subscribed() {
        let session = Session::new(true);
        assert_eq!(session.ensure_subscribed(), Err(AssetError::NotSubscribed));

        let controller = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
        session.subscribe(controller);
        assert_eq!(session.ensure_subscribed(), Ok(()));
        assert_eq!(session.controller(), Some(controller));

        assert_eq!(session.unsubscribe(), Some(controller));
        assert!(session.ensure_subscribed().is_err());
        assert_eq!(session.unsubscribe(), None);
    }

    #[test]
    fn test_optional_session_never_gates() {
        let session = Session::new(false);
        assert!(session.ensure_subscribed().is_ok());
    }
}
