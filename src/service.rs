//! Login flow around a verified OpenID assertion.
//!
//! Handles the provider's redirect, keeps the verified user in the session
//! store while they pick an affiliation, and then applies the login rules.
//! A callback is only honoured for a login this service started, and the
//! verified user always lands under a fresh session id.

use std::sync::Arc;

use uuid::Uuid;

use crate::{
    auth::{
        AssertionMode, AuthError, CallbackParams, LoginState, OpenidVerifier, RoleChoices,
        SharedSessionStore, UserRecord, openid,
    },
    authz::{self, RuleSet},
    config::{OpenidConfig, RedirectConfig},
};

/// How long the provider round trip may take.
const LOGIN_STATE_MAX_AGE_MINUTES: i64 = 10;

/// Where a login attempt ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// The user cancelled at the provider.
    Cancelled,
    /// The provider did not vouch for the assertion.
    VerificationFailed,
    /// The callback was reached without an assertion, or without a login
    /// started by this service.
    OutOfFlow,
    /// The user holds several affiliations and must pick one.
    SelectRole(RoleChoices),
    Allowed(UserRecord),
    Denied,
}

/// A login handed to the provider.
#[derive(Debug, Clone)]
pub struct LoginStart {
    /// One-time id the browser must present on the callback.
    pub flow_id: Uuid,
    pub auth_url: String,
}

/// Result of the provider callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Session now holding the verified user, if one was kept.
    pub session_id: Option<Uuid>,
    pub outcome: LoginOutcome,
}

impl Completion {
    fn ended(outcome: LoginOutcome) -> Self {
        Self {
            session_id: None,
            outcome,
        }
    }
}

pub struct LoginService {
    config: OpenidConfig,
    rules: RuleSet,
    verifier: Arc<dyn OpenidVerifier>,
    sessions: SharedSessionStore,
}

impl LoginService {
    /// Compile the configured rules and wire the collaborators together.
    pub fn new(
        config: OpenidConfig,
        verifier: Arc<dyn OpenidVerifier>,
        sessions: SharedSessionStore,
    ) -> Result<Self, AuthError> {
        let rules = config.rules()?;
        tracing::info!(rules = rules.len(), "Login rules compiled");
        Ok(Self {
            config,
            rules,
            verifier,
            sessions,
        })
    }

    pub fn config(&self) -> &OpenidConfig {
        &self.config
    }

    pub fn redirects(&self) -> &RedirectConfig {
        &self.config.redirects
    }

    /// URL the user is sent to in order to log in at the provider.
    pub fn auth_url(&self) -> Result<String, AuthError> {
        openid::auth_url(&self.config)
    }

    /// Start a login: remember it and build the provider URL.
    pub async fn begin(&self) -> Result<LoginStart, AuthError> {
        let auth_url = self.auth_url()?;
        let state = LoginState::new();
        let flow_id = state.id;
        self.sessions.store_login_state(state).await?;
        tracing::debug!(flow_id = %flow_id, "Login started");
        Ok(LoginStart { flow_id, auth_url })
    }

    /// Handle the provider's redirect back to us.
    ///
    /// `flow_id` is the id handed out by [`begin`](Self::begin). It is
    /// consumed here whatever the outcome.
    #[tracing::instrument(skip(self, params))]
    pub async fn complete(
        &self,
        flow_id: Option<Uuid>,
        params: &CallbackParams,
    ) -> Result<Completion, AuthError> {
        let state = match flow_id {
            Some(id) => self.sessions.take_login_state(id).await?,
            None => None,
        };

        match params.mode() {
            AssertionMode::Cancel => {
                tracing::info!("User cancelled at the provider");
                return Ok(Completion::ended(LoginOutcome::Cancelled));
            }
            AssertionMode::Other => {
                tracing::debug!(mode = ?params.get("openid.mode"), "Callback outside of a login flow");
                return Ok(Completion::ended(LoginOutcome::OutOfFlow));
            }
            AssertionMode::IdRes => {}
        }

        let max_age = chrono::Duration::minutes(LOGIN_STATE_MAX_AGE_MINUTES);
        if !state.is_some_and(|s| !s.is_older_than(max_age)) {
            tracing::warn!("Assertion arrived without a login started here");
            return Ok(Completion::ended(LoginOutcome::OutOfFlow));
        }

        if !self.verifier.verify(params).await? {
            tracing::warn!("OpenID assertion failed verification");
            return Ok(Completion::ended(LoginOutcome::VerificationFailed));
        }

        let signed = params.signed();
        let identity = signed
            .identity_url()
            .ok_or_else(|| AuthError::ProviderData("assertion signs no identity".into()))?;
        let user = UserRecord::from_claims(&signed.claims(), identity, &self.config.required)?;

        let session_id = Uuid::new_v4();
        tracing::info!(
            account_id = %user.account_id(),
            session_id = %session_id,
            "OpenID assertion verified"
        );
        self.sessions.set(session_id, user).await?;

        let outcome = self.check(session_id, None).await?;
        let kept = !matches!(outcome, LoginOutcome::Denied);
        Ok(Completion {
            session_id: kept.then_some(session_id),
            outcome,
        })
    }

    /// Apply the login rules to the user held in the session.
    ///
    /// With `selected` the user's affiliations are first narrowed to that
    /// zero-based index and the narrowed record is stored back. Without it, a
    /// user with several affiliations is asked to choose.
    #[tracing::instrument(skip(self))]
    pub async fn check(
        &self,
        session_id: Uuid,
        selected: Option<usize>,
    ) -> Result<LoginOutcome, AuthError> {
        let mut user = self.current_user(session_id).await?;

        match selected {
            Some(index) => {
                user.select_role(index)?;
                self.sessions.set(session_id, user.clone()).await?;
            }
            None if user.has_multiple_roles() => {
                tracing::debug!(
                    account_id = %user.account_id(),
                    affiliations = user.auth_info().len(),
                    "Awaiting role selection"
                );
                return Ok(LoginOutcome::SelectRole(user.role_choices()));
            }
            None => {}
        }

        if authz::can_login(&self.rules, &user) {
            tracing::info!(account_id = %user.account_id(), "Login allowed");
            Ok(LoginOutcome::Allowed(user))
        } else {
            tracing::info!(account_id = %user.account_id(), "Login denied by rules");
            self.sessions.clear(session_id).await?;
            Ok(LoginOutcome::Denied)
        }
    }

    /// The verified user held in the session.
    pub async fn current_user(&self, session_id: Uuid) -> Result<UserRecord, AuthError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or(AuthError::EmptyUser)
    }

    /// Hand the allowed user over to the host app and forget it.
    ///
    /// A second call for the same session yields `EmptyUser`.
    pub async fn take_user(&self, session_id: Uuid) -> Result<UserRecord, AuthError> {
        let user = self.current_user(session_id).await?;
        if user.has_multiple_roles() || !authz::can_login(&self.rules, &user) {
            return Err(AuthError::EmptyUser);
        }
        self.sessions.clear(session_id).await?;
        tracing::debug!(account_id = %user.account_id(), "User handed over");
        Ok(user)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{collections::HashMap, time::Duration};

    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_string_contains, method},
    };

    use super::*;
    use crate::auth::{
        DirectVerifier, MemorySessionStore, SessionStore,
        openid::{AX_NS, OPENID_NS},
        user::tests::YULIN,
    };

    pub(crate) const TWO_UNITS: &str = r#"[
        {"id":"A","name":"School A","role":"teacher","title":"director","groups":[]},
        {"id":"B","name":"School B","role":"student","title":"","groups":[]}
    ]"#;

    const PRINCIPAL: &str =
        r#"[{"id":"014569","name":"Yulin JH","role":"principal","title":"","groups":[]}]"#;

    /// Verifier with a fixed verdict.
    pub(crate) struct StaticVerifier(pub bool);

    #[async_trait]
    impl OpenidVerifier for StaticVerifier {
        async fn verify(&self, _params: &CallbackParams) -> Result<bool, AuthError> {
            Ok(self.0)
        }
    }

    fn raw_assertion(auth_info: &str, config: &OpenidConfig) -> HashMap<String, String> {
        let nonce = format!(
            "{}{}",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            Uuid::new_v4().simple()
        );
        [
            ("openid.ns", OPENID_NS),
            ("openid.mode", "id_res"),
            ("openid.op_endpoint", config.endpoint()),
            ("openid.return_to", config.return_to.as_str()),
            ("openid.response_nonce", nonce.as_str()),
            ("openid.assoc_handle", "{HMAC-SHA256}{5f1a}{c2lnbg==}"),
            ("openid.sig", "c2lnbmF0dXJl"),
            ("openid.identity", "https://openid.ntpc.edu.tw/user/amy"),
            ("openid.ns.ax", AX_NS),
            ("openid.ax.mode", "fetch_response"),
            ("openid.ax.type.namePerson", "http://axschema.org/namePerson"),
            ("openid.ax.value.namePerson", "Amy Lin"),
            ("openid.ax.type.pref_timezone", "http://axschema.org/pref/timezone"),
            ("openid.ax.value.pref_timezone", auth_info),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    /// Sign every field except `unsigned`.
    fn signed_except(mut raw: HashMap<String, String>, unsigned: &[&str]) -> CallbackParams {
        let mut signed: Vec<&str> = raw
            .keys()
            .filter_map(|k| k.strip_prefix("openid."))
            .filter(|f| !matches!(*f, "sig" | "signed") && !unsigned.contains(f))
            .collect();
        signed.sort_unstable();
        let signed = signed.join(",");
        raw.insert("openid.signed".into(), signed);
        CallbackParams::new(raw)
    }

    /// A positive assertion whose every field is signed.
    pub(crate) fn assertion(auth_info: &str) -> CallbackParams {
        signed_except(raw_assertion(auth_info, &OpenidConfig::default()), &[])
    }

    fn mode(mode: &str) -> CallbackParams {
        CallbackParams::new(HashMap::from([("openid.mode".into(), mode.into())]))
    }

    fn service(
        rules: serde_json::Value,
        verdict: bool,
    ) -> (LoginService, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new(Duration::from_secs(60)));
        let config = OpenidConfig {
            can_login_rules: rules.as_array().cloned().unwrap_or_default(),
            ..OpenidConfig::default()
        };
        let service =
            LoginService::new(config, Arc::new(StaticVerifier(verdict)), store.clone()).unwrap();
        (service, store)
    }

    /// Run a whole login and return the session holding the user.
    async fn login(service: &LoginService, auth_info: &str) -> (Uuid, LoginOutcome) {
        let flow = service.begin().await.unwrap().flow_id;
        let completion = service.complete(Some(flow), &assertion(auth_info)).await.unwrap();
        (completion.session_id.unwrap_or(flow), completion.outcome)
    }

    #[tokio::test]
    async fn test_begin_returns_provider_url() {
        let (service, store) = service(json!([]), true);
        let start = service.begin().await.unwrap();
        assert!(start.auth_url.contains("checkid_setup"));
        assert!(store.take_login_state(start.flow_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_and_out_of_flow() {
        let (service, store) = service(json!([]), true);
        let flow = service.begin().await.unwrap().flow_id;
        assert_eq!(
            service.complete(Some(flow), &mode("cancel")).await.unwrap(),
            Completion::ended(LoginOutcome::Cancelled)
        );
        assert_eq!(
            service.complete(None, &CallbackParams::default()).await.unwrap(),
            Completion::ended(LoginOutcome::OutOfFlow)
        );
        assert!(store.is_empty().await);
        // Cancelling consumed the login.
        assert_eq!(store.take_login_state(flow).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_assertion_without_started_login_is_out_of_flow() {
        let (service, store) = service(json!([{"unitCode": "014569", "role": "teacher"}]), true);
        let planted = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();

        for flow in [None, Some(planted)] {
            let completion = service.complete(flow, &assertion(YULIN)).await.unwrap();
            assert_eq!(completion, Completion::ended(LoginOutcome::OutOfFlow));
        }
        assert!(store.is_empty().await);
        assert!(matches!(
            service.check(planted, None).await,
            Err(AuthError::EmptyUser)
        ));
    }

    #[tokio::test]
    async fn test_login_state_is_single_use() {
        let (service, _store) = service(json!([{"unitCode": "014569", "role": "teacher"}]), true);
        let flow = service.begin().await.unwrap().flow_id;

        let first = service.complete(Some(flow), &assertion(YULIN)).await.unwrap();
        assert!(matches!(first.outcome, LoginOutcome::Allowed(_)));
        let second = service.complete(Some(flow), &assertion(YULIN)).await.unwrap();
        assert_eq!(second, Completion::ended(LoginOutcome::OutOfFlow));
    }

    #[tokio::test]
    async fn test_stale_login_state_is_out_of_flow() {
        let (service, store) = service(json!([]), true);
        let state = LoginState {
            id: Uuid::new_v4(),
            created_at: Utc::now() - chrono::Duration::minutes(11),
        };
        store.store_login_state(state.clone()).await.unwrap();

        let completion = service.complete(Some(state.id), &assertion(YULIN)).await.unwrap();
        assert_eq!(completion.outcome, LoginOutcome::OutOfFlow);
    }

    #[tokio::test]
    async fn test_unverified_assertion_fails() {
        let (service, store) = service(json!([]), false);
        let (_, outcome) = login(&service, YULIN).await;
        assert_eq!(outcome, LoginOutcome::VerificationFailed);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_single_affiliation_allowed_under_new_session() {
        let (service, store) = service(json!([{"unitCode": "014569", "role": "teacher"}]), true);
        let flow = service.begin().await.unwrap().flow_id;

        let completion = service.complete(Some(flow), &assertion(YULIN)).await.unwrap();
        let LoginOutcome::Allowed(user) = completion.outcome else {
            panic!("expected allowed, got {:?}", completion.outcome);
        };
        let session = completion.session_id.unwrap();
        assert_ne!(session, flow);
        assert_eq!(user.account_id(), "amy");
        assert_eq!(store.get(session).await.unwrap(), Some(user));
        assert_eq!(store.get(flow).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unsigned_attributes_do_not_grant_login() {
        let rules = json!([{"unitCode": "014569", "role": "principal"}]);
        let (service, store) = service(rules, true);
        let raw = raw_assertion(PRINCIPAL, service.config());

        // Only the protocol fields are signed: there is no vouched identity.
        let flow = service.begin().await.unwrap().flow_id;
        let unsigned: Vec<&str> = raw
            .keys()
            .filter_map(|k| k.strip_prefix("openid."))
            .filter(|f| f.starts_with("ax.") || matches!(*f, "identity" | "ns.ax"))
            .collect();
        let params = signed_except(raw.clone(), &unsigned);
        let err = service.complete(Some(flow), &params).await.unwrap_err();
        assert!(matches!(err, AuthError::ProviderData(_)));

        // Identity signed, affiliation payload not: the payload is dropped.
        let flow = service.begin().await.unwrap().flow_id;
        let params = signed_except(raw, &["ax.value.pref_timezone"]);
        let completion = service.complete(Some(flow), &params).await.unwrap();
        assert_eq!(completion, Completion::ended(LoginOutcome::Denied));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_replayed_assertion_fails_verification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("openid.mode=check_authentication"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("ns:http://specs.openid.net/auth/2.0\nis_valid:true\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let config = OpenidConfig {
            endpoint: Some(server.uri()),
            can_login_rules: vec![json!({"role": "teacher"})],
            ..OpenidConfig::default()
        };
        let store = Arc::new(MemorySessionStore::default());
        let verifier = Arc::new(DirectVerifier::new(&config));
        let params = signed_except(raw_assertion(YULIN, &config), &[]);
        let service = LoginService::new(config, verifier, store).unwrap();

        let flow = service.begin().await.unwrap().flow_id;
        let first = service.complete(Some(flow), &params).await.unwrap();
        assert!(matches!(first.outcome, LoginOutcome::Allowed(_)));

        let flow = service.begin().await.unwrap().flow_id;
        let replay = service.complete(Some(flow), &params).await.unwrap();
        assert_eq!(replay, Completion::ended(LoginOutcome::VerificationFailed));
    }

    #[tokio::test]
    async fn test_denied_clears_session() {
        let (service, store) = service(json!([{"unitCode": "014569", "role": "student"}]), true);
        let flow = service.begin().await.unwrap().flow_id;

        let completion = service.complete(Some(flow), &assertion(YULIN)).await.unwrap();
        assert_eq!(completion, Completion::ended(LoginOutcome::Denied));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_multiple_affiliations_need_selection() {
        let (service, store) = service(json!([{"role": "student"}]), true);

        let (id, outcome) = login(&service, TWO_UNITS).await;
        let LoginOutcome::SelectRole(choices) = outcome else {
            panic!("expected role selection, got {outcome:?}");
        };
        assert_eq!(choices.name.as_deref(), Some("Amy Lin"));
        assert_eq!(choices.auth_infos.len(), 2);
        assert!(store.get(id).await.unwrap().is_some());

        // Picking the student affiliation satisfies the rule.
        let outcome = service.check(id, Some(1)).await.unwrap();
        let LoginOutcome::Allowed(user) = outcome else {
            panic!("expected allowed, got {outcome:?}");
        };
        assert_eq!(user.auth_info().len(), 1);
        assert_eq!(user.auth_info()[0].unit_code, "B");
        assert_eq!(store.get(id).await.unwrap(), Some(user));
    }

    #[tokio::test]
    async fn test_selection_narrows_before_rules() {
        let (service, store) = service(json!([{"role": "student"}]), true);
        let (id, _) = login(&service, TWO_UNITS).await;

        assert_eq!(service.check(id, Some(0)).await.unwrap(), LoginOutcome::Denied);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_out_of_range_selection() {
        let (service, _store) = service(json!([]), true);
        let (id, _) = login(&service, TWO_UNITS).await;

        let err = service.check(id, Some(2)).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidRoleSelection {
                index: 2,
                available: 2
            }
        ));
        // The stored user is untouched and can still choose.
        assert_eq!(service.current_user(id).await.unwrap().auth_info().len(), 2);
    }

    #[tokio::test]
    async fn test_check_without_session_is_empty_user() {
        let (service, _store) = service(json!([]), true);
        let err = service.check(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, AuthError::EmptyUser));
    }

    #[tokio::test]
    async fn test_malformed_auth_info_stores_nothing() {
        let (service, store) = service(json!([]), true);
        let flow = service.begin().await.unwrap().flow_id;

        let err = service.complete(Some(flow), &assertion("not json")).await.unwrap_err();
        assert!(matches!(err, AuthError::ProviderData(_)));
        assert!(store.is_empty().await);
        assert_eq!(store.take_login_state(flow).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_allowed_user_taken_once() {
        let (service, store) = service(json!([{"role": "teacher"}]), true);
        let (id, outcome) = login(&service, YULIN).await;
        assert!(matches!(outcome, LoginOutcome::Allowed(_)));

        assert_eq!(service.take_user(id).await.unwrap().account_id(), "amy");
        assert!(store.is_empty().await);
        assert!(matches!(service.take_user(id).await, Err(AuthError::EmptyUser)));
    }

    #[tokio::test]
    async fn test_pending_selection_cannot_be_taken() {
        let (service, store) = service(json!([]), true);
        let (id, _) = login(&service, TWO_UNITS).await;

        assert!(matches!(service.take_user(id).await, Err(AuthError::EmptyUser)));
        assert!(store.get(id).await.unwrap().is_some());
    }

    #[test]
    fn test_malformed_rules_rejected_at_construction() {
        let config = OpenidConfig {
            can_login_rules: vec![json!(["teacher"])],
            ..OpenidConfig::default()
        };
        let result = LoginService::new(
            config,
            Arc::new(StaticVerifier(true)),
            Arc::new(MemorySessionStore::default()),
        );
        assert!(matches!(result, Err(AuthError::RuleFormat { index: 0, .. })));
    }
}
