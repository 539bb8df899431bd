//! Credential manager tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;

const TTL: Duration = Duration::from_secs(300);

/// Counts logins; answers from a script, then with fresh tokens
#[derive(Default)]
struct FakeLogin {
    calls: AtomicUsize,
    delay: Duration,
    script: Mutex<VecDeque<Result<LoginGrant, AuthError>>>,
}

impl FakeLogin {
    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn then(self, result: Result<LoginGrant, AuthError>) -> Self {
        self.script.lock().push_back(result);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoginClient for FakeLogin {
    async fn login(&self) -> Result<LoginGrant, AuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let scripted = self.script.lock().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(LoginGrant {
                token: format!("token-{}", n),
                expires_in: None,
            })
        })
    }
}

fn manager(login: &Arc<FakeLogin>) -> CredentialManager {
    CredentialManager::new(login.clone(), TTL)
}

fn rejected() -> Result<LoginGrant, AuthError> {
    Err(AuthError::Rejected("bad password".to_string()))
}

#[test]
fn test_credential_validity_window() {
    let credential = Credential::new("t", Duration::from_secs(100));
    let start = credential.issued_at();

    assert!(credential.is_valid_at(start));
    assert!(credential.is_valid_at(start + Duration::from_secs(99)));
    assert!(!credential.is_valid_at(start + Duration::from_secs(100)));

    assert!(!credential.needs_refresh_at(start + Duration::from_secs(89), 0.1));
    assert!(credential.needs_refresh_at(start + Duration::from_secs(90), 0.1));
    assert!(!credential.needs_refresh_at(start + Duration::from_secs(99), 0.0));
}

#[test]
fn test_debug_redacts_token() {
    let credential = Credential::new("super-secret", TTL);
    assert!(!format!("{:?}", credential).contains("super-secret"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquire_single_flight() {
    let login = Arc::new(FakeLogin::slow(Duration::from_millis(200)));
    let manager = Arc::new(manager(&login));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire().await })
        })
        .collect();

    let mut credentials = Vec::new();
    for handle in handles {
        credentials.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(login.calls(), 1);
    assert_eq!(credentials[0].token(), "token-1");
    assert!(credentials.iter().all(|c| Arc::ptr_eq(c, &credentials[0])));
}

#[tokio::test(start_paused = true)]
async fn test_valid_credential_needs_no_login() {
    let login = Arc::new(FakeLogin::default());
    let manager = manager(&login);

    let first = manager.acquire().await.unwrap();
    tokio::time::advance(Duration::from_secs(200)).await;
    let second = manager.acquire().await.unwrap();

    assert_eq!(login.calls(), 1);
    assert!(Arc::ptr_eq(&first, &second));
}

#[tokio::test(start_paused = true)]
async fn test_expired_credential_triggers_one_refresh() {
    let login = Arc::new(FakeLogin::default());
    let manager = manager(&login);

    manager.acquire().await.unwrap();
    tokio::time::advance(TTL + Duration::from_secs(1)).await;

    let refreshed = manager.acquire().await.unwrap();
    assert_eq!(refreshed.token(), "token-2");
    assert_eq!(login.calls(), 2);

    manager.acquire().await.unwrap();
    assert_eq!(login.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_inside_margin() {
    let login = Arc::new(FakeLogin::default());
    let manager = manager(&login);

    manager.acquire().await.unwrap();
    // 10% of 300s is 30s: at 275s the token is still valid but due
    tokio::time::advance(Duration::from_secs(275)).await;
    assert_eq!(manager.acquire().await.unwrap().token(), "token-2");
}

#[tokio::test(start_paused = true)]
async fn test_failed_proactive_refresh_keeps_credential() {
    let login = Arc::new(FakeLogin::default().then(Ok(LoginGrant {
        token: "first".to_string(),
        expires_in: None,
    })));
    let manager = manager(&login);
    manager.acquire().await.unwrap();

    login.script.lock().push_back(rejected());
    tokio::time::advance(Duration::from_secs(280)).await;

    let held = manager.acquire().await.unwrap();
    assert_eq!(held.token(), "first");
    assert_eq!(login.calls(), 2);
    assert_eq!(manager.current().unwrap().token(), "first");
}

#[tokio::test(start_paused = true)]
async fn test_failed_login_without_valid_credential() {
    let login = Arc::new(FakeLogin::default().then(rejected()));
    let manager = manager(&login);

    assert_eq!(
        manager.acquire().await.unwrap_err(),
        AuthError::Rejected("bad password".to_string())
    );
    assert!(manager.current().is_none());

    // The next call tries again
    assert_eq!(manager.acquire().await.unwrap().token(), "token-2");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_failure() {
    let login = Arc::new(FakeLogin::slow(Duration::from_millis(100)).then(rejected()));
    let manager = Arc::new(manager(&login));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire().await })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }
    assert_eq!(login.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_force_refresh_always_logs_in() {
    let login = Arc::new(FakeLogin::default());
    let manager = manager(&login);

    manager.acquire().await.unwrap();
    let forced = manager.force_refresh().await.unwrap();

    assert_eq!(login.calls(), 2);
    assert_eq!(forced.token(), "token-2");
    assert_eq!(manager.current().unwrap().token(), "token-2");
}

#[tokio::test(start_paused = true)]
async fn test_failed_force_refresh_keeps_credential() {
    let login = Arc::new(FakeLogin::default());
    let manager = manager(&login);
    manager.acquire().await.unwrap();

    login.script.lock().push_back(Err(AuthError::Transport("timeout".to_string())));
    assert!(manager.force_refresh().await.is_err());
    assert_eq!(manager.current().unwrap().token(), "token-1");
    assert_eq!(manager.acquire().await.unwrap().token(), "token-1");
    assert_eq!(login.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_server_reported_lifetime() {
    let login = Arc::new(FakeLogin::default().then(Ok(LoginGrant {
        token: "short".to_string(),
        expires_in: Some(Duration::from_secs(60)),
    })));
    let manager = manager(&login);

    let credential = manager.acquire().await.unwrap();
    assert_eq!(credential.ttl(), Duration::from_secs(60));

    tokio::time::advance(Duration::from_secs(55)).await;
    assert_eq!(manager.acquire().await.unwrap().token(), "token-2");
}

#[tokio::test(start_paused = true)]
async fn test_credential_source_presents_token() {
    let login = Arc::new(FakeLogin::default());
    let manager = manager(&login);

    let password = manager.password().await.unwrap();
    assert_eq!(password.as_deref(), Some(&b"token-1"[..]));

    manager.rejected().await;
    assert!(manager.current().is_none());
    let password = manager.password().await.unwrap();
    assert_eq!(password.as_deref(), Some(&b"token-2"[..]));
}
