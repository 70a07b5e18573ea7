//! Screen lock: deferred release of the screen-gated levels

use elk_core::{KeyError, KeyResult, ProtectionLevel, UserAuth, UserId};
use std::sync::Arc;
use tracing::{debug, error, info};

use super::KeyManager;
use crate::base_key::{ActivateFlag, BaseKey, DeactivateFlag};
use crate::delay::DelayHandler;
use crate::lock;

impl KeyManager {
    fn delay_handler(&self, user: UserId) -> Arc<DelayHandler> {
        let mut delays = lock(&self.delays);
        Arc::clone(delays.entry(user).or_insert_with(|| {
            Arc::new(DelayHandler::new(user, self.lock_delay(), self.runtime.clone()))
        }))
    }

    fn screen_gated_keys(&self, user: UserId) -> Vec<Arc<BaseKey>> {
        self.user_keys(user)
            .into_iter()
            .filter(|key| key.level().screen_lock_gated())
            .collect()
    }

    /// Mark the user's screen locked and schedule release of the active
    /// screen-gated keys after the lock delay.
    pub fn lock_user_screen(&self, user: UserId) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        if !self.user_exists(user) {
            return Err(KeyError::UserNotFound(user));
        }
        self.update_status(user, |status| status.screen_locked = true);

        let active: Vec<Arc<BaseKey>> = self
            .screen_gated_keys(user)
            .into_iter()
            .filter(|key| key.is_active())
            .collect();
        if active.is_empty() {
            debug!(user, "screen locked, no gated keys active");
            return Ok(());
        }

        let mount = self.mount();
        self.delay_handler(user).arm(move || {
            for key in active.iter().rev() {
                if !key.is_active() {
                    continue;
                }
                match key.inactive_key(DeactivateFlag::Logout, &mount) {
                    Ok(()) => debug!(user, level = %key.level(), "released on screen lock"),
                    Err(e) => error!(user, level = %key.level(), "screen-lock release failed: {e}"),
                }
            }
        });
        info!(user, "screen locked");
        Ok(())
    }

    /// Unlock the user's screen. Inside the lock delay nothing was
    /// released yet and no key is touched; otherwise the released levels
    /// are restored with the credential and activated again.
    pub fn unlock_user_screen(
        &self,
        user: UserId,
        token: Vec<u8>,
        secret: Vec<u8>,
    ) -> KeyResult<()> {
        let transition = self.transition_lock(user);
        let _serial = lock(&transition);
        if !self.user_exists(user) {
            return Err(KeyError::UserNotFound(user));
        }
        let handler = self.delay_handler(user);
        if handler.cancel() {
            self.update_status(user, |status| status.screen_locked = false);
            info!(user, "screen unlocked within lock delay");
            return Ok(());
        }
        handler.wait_idle();

        let auth = UserAuth::new(token, secret);
        let mount = self.mount();
        for level in ProtectionLevel::USER_LEVELS
            .into_iter()
            .filter(|level| level.screen_lock_gated())
        {
            if level.is_uece() && !self.uece_supported() {
                continue;
            }
            let Some(key) = self.stored_key(user, level) else {
                continue;
            };
            if key.is_active() {
                continue;
            }
            self.restore_with_fallback(&key, &auth)?;
            key.active_key(ActivateFlag::Retrieve, &mount)?;
        }
        self.update_status(user, |status| status.screen_locked = false);
        info!(user, "screen unlocked");
        Ok(())
    }

    pub fn get_lock_screen_status(&self, user: UserId) -> KeyResult<bool> {
        if let Some(status) = lock(&self.users).get(&user) {
            return Ok(status.screen_locked);
        }
        if self.user_exists(user) {
            Ok(false)
        } else {
            Err(KeyError::UserNotFound(user))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fixture;
    use elk_core::{KeyError, LevelMask, ProtectionLevel};
    use std::time::Duration;

    async fn settle(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lock_releases_gated_levels_after_delay() {
        let f = fixture(true, false);
        f.manager.generate_user_keys(100, LevelMask::ALL).unwrap();

        f.manager.lock_user_screen(100).unwrap();
        assert!(f.manager.get_lock_screen_status(100).unwrap());
        assert!(f.manager.key(100, ProtectionLevel::El4).unwrap().is_active());

        settle(300).await;
        assert!(!f.manager.key(100, ProtectionLevel::El4).unwrap().is_active());
        assert!(!f.manager.key(100, ProtectionLevel::El5).unwrap().is_active());
        assert!(f.manager.key(100, ProtectionLevel::El3).unwrap().is_active());
        assert!(f.manager.key(100, ProtectionLevel::El2).unwrap().is_active());

        f.manager.unlock_user_screen(100, vec![], vec![]).unwrap();
        assert!(!f.manager.get_lock_screen_status(100).unwrap());
        assert!(f.manager.key(100, ProtectionLevel::El4).unwrap().is_active());
        assert!(f.manager.key(100, ProtectionLevel::El5).unwrap().is_active());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_quick_unlock_touches_nothing() {
        let f = fixture(false, false);
        f.manager.generate_user_keys(100, LevelMask::ALL).unwrap();
        let el4 = f.manager.key(100, ProtectionLevel::El4).unwrap();
        let before = el4.descriptor();

        f.manager.lock_user_screen(100).unwrap();
        // Wrong secret: any crypto work would fail.
        f.manager
            .unlock_user_screen(100, vec![], b"wrong".to_vec())
            .unwrap();

        settle(200).await;
        assert!(el4.is_active());
        assert_eq!(el4.descriptor(), before);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let f = fixture(false, false);
        assert!(matches!(
            f.manager.lock_user_screen(400),
            Err(KeyError::UserNotFound(400))
        ));
        assert!(matches!(
            f.manager.get_lock_screen_status(400),
            Err(KeyError::UserNotFound(400))
        ));
    }
}
