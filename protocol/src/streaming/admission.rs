//! # Stream Admission
//!
//! Decides whether a client may stream a link and what it must prove
//! first. The checks run in this order:
//!
//! 1. Unknown link or an overloaded host: denied.
//! 2. A live session for the client: granted again, no new slot.
//! 3. Link at its stream cap: denied.
//! 4. The link's uploader or the node admin, proven by signature: granted.
//! 5. A premium subscriber: asked for a signed premium proof.
//! 6. Anyone else: shown an ad from a randomly drawn active campaign and
//!    asked for a signed proof of that view. No eligible campaign: denied.
//!
//! A proof is `VIEW:<linkId>:<campaignId>:<clientKey>` signed by the
//! viewer's wallet. Accepting an ad proof records the view with the
//! registry, which is what decrements the campaign's remaining views.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::seq::SliceRandom;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::load::{is_overloaded, LoadSource};
use super::session::{client_key, ClaimError, SessionGrant, SessionTable, StreamGuard, StreamSession};
use crate::catalog::{LinkRegistry, RegisteredLink, SlotError};
use crate::config::{AdmissionConfig, OWNER_PROOF, PREMIUM_PROOF, SESSION_SWEEP_INTERVAL};
use crate::crypto::keys::RecoverableSignature;
use crate::crypto::signatures::{addresses_match, recover, view_proof_message};
use crate::registry::{Campaign, Registry, RegistryError, RegistryTransaction};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("proof signature does not verify")]
    BadProof,

    #[error("{0} has no premium subscription")]
    NotPremium(String),

    #[error("campaign {0} is not accepting views")]
    CampaignUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotFound,
    Overloaded,
    AtCapacity,
    NoAdAvailable,
}

impl From<SlotError> for DenyReason {
    fn from(e: SlotError) -> Self {
        match e {
            SlotError::NotFound => Self::NotFound,
            SlotError::AtCapacity => Self::AtCapacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Granted {
        token: String,
        expires_at: i64,
    },
    RequireProof {
        /// Campaign to view, or `premium`.
        campaign_id: String,
        /// Content the ad points at; absent for premium proofs.
        content_id: Option<String>,
        /// The exact text to sign.
        message: String,
    },
    Denied {
        reason: DenyReason,
    },
}

impl AdmissionDecision {
    fn granted(session: &StreamSession) -> Self {
        Self::Granted {
            token: session.token.clone(),
            expires_at: session.expires_at,
        }
    }

    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// An authorization attempt.
#[derive(Debug, Clone, Default)]
pub struct AuthorizeRequest {
    pub client_ip: String,
    /// Wallet the client claims. Only trusted once a signature recovers to it.
    pub wallet: Option<String>,
    /// Owner proof: `VIEW:<linkId>:owner:<clientKey>`.
    pub signature: Option<RecoverableSignature>,
}

/// A signed view proof.
#[derive(Debug, Clone)]
pub struct ProofSubmission {
    pub client_ip: String,
    pub campaign_id: String,
    pub wallet: Option<String>,
    pub signature: RecoverableSignature,
}

pub struct StreamAdmission {
    links: Arc<LinkRegistry>,
    sessions: Arc<SessionTable>,
    registry: Arc<dyn Registry>,
    load: Arc<dyn LoadSource>,
    config: AdmissionConfig,
    admin_wallet: Option<String>,
    granted: AtomicU64,
    denied: AtomicU64,
}

impl StreamAdmission {
    pub fn new(
        links: Arc<LinkRegistry>,
        registry: Arc<dyn Registry>,
        load: Arc<dyn LoadSource>,
        config: AdmissionConfig,
        admin_wallet: Option<String>,
    ) -> Self {
        let sessions = Arc::new(SessionTable::new(links.clone(), config.session_duration));
        Self {
            links,
            sessions,
            registry,
            load,
            config,
            admin_wallet,
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn granted(&self) -> u64 {
        self.granted.load(Ordering::Relaxed)
    }

    pub fn denied(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }

    fn deny(&self, link_id: &str, reason: DenyReason) -> AdmissionDecision {
        self.denied.fetch_add(1, Ordering::Relaxed);
        debug!(link = %link_id, ?reason, "stream denied");
        AdmissionDecision::Denied { reason }
    }

    fn grant(&self, session: &StreamSession) -> AdmissionDecision {
        self.granted.fetch_add(1, Ordering::Relaxed);
        AdmissionDecision::granted(session)
    }

    fn open(&self, link_id: &str, key: &str, grant: SessionGrant) -> AdmissionDecision {
        match self.sessions.open(link_id, key, grant, chrono::Utc::now().timestamp()) {
            Ok(session) => self.grant(&session),
            Err(e) => self.deny(link_id, e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Authorization
    // -----------------------------------------------------------------------

    pub async fn authorize(
        &self,
        link_id: &str,
        request: &AuthorizeRequest,
    ) -> Result<AdmissionDecision, AdmissionError> {
        let Some(link) = self.links.get(link_id) else {
            return Ok(self.deny(link_id, DenyReason::NotFound));
        };
        if is_overloaded(self.load.as_ref(), &self.config) {
            return Ok(self.deny(link_id, DenyReason::Overloaded));
        }

        let key = client_key(&request.client_ip, link_id);
        let now = chrono::Utc::now().timestamp();
        if let Some(session) = self.sessions.live_for_client(&key, now) {
            return Ok(AdmissionDecision::granted(&session));
        }
        if !link.has_capacity() {
            return Ok(self.deny(link_id, DenyReason::AtCapacity));
        }

        if let Some(owner) = self.proven_owner(&link, &key, request) {
            info!(link = %link_id, %owner, "owner stream granted");
            return Ok(self.open(link_id, &key, SessionGrant::Owner));
        }

        if let Some(wallet) = request.wallet.as_deref() {
            if self.registry.has_premium(wallet).await? {
                return Ok(AdmissionDecision::RequireProof {
                    campaign_id: PREMIUM_PROOF.to_string(),
                    content_id: None,
                    message: view_proof_message(link_id, PREMIUM_PROOF, &key),
                });
            }
        }

        match self.select_ad().await? {
            Some(campaign) => Ok(AdmissionDecision::RequireProof {
                message: view_proof_message(link_id, &campaign.id, &key),
                campaign_id: campaign.id,
                content_id: Some(campaign.content_id),
            }),
            None => Ok(self.deny(link_id, DenyReason::NoAdAvailable)),
        }
    }

    /// The wallet that signed an owner proof, if it is the uploader or the
    /// node admin.
    fn proven_owner(&self, link: &RegisteredLink, key: &str, request: &AuthorizeRequest) -> Option<String> {
        let signature = request.signature.as_ref()?;
        let signer = recover(&view_proof_message(&link.id, OWNER_PROOF, key), signature).ok()?;
        if let Some(claimed) = request.wallet.as_deref() {
            if !addresses_match(claimed, &signer) {
                return None;
            }
        }
        let is_uploader = addresses_match(&signer, &link.manifest.uploader_wallet);
        let is_admin = self
            .admin_wallet
            .as_deref()
            .is_some_and(|admin| addresses_match(&signer, admin));
        (is_uploader || is_admin).then_some(signer)
    }

    /// Draws up to `ad_selection_attempts` random active campaigns and
    /// returns the first that still has views left.
    pub async fn select_ad(&self) -> Result<Option<Campaign>, AdmissionError> {
        let campaigns = self.registry.active_campaigns().await?;
        let mut rng = rand::thread_rng();
        for _ in 0..self.config.ad_selection_attempts {
            let Some(candidate) = campaigns.choose(&mut rng) else {
                break;
            };
            if candidate.has_capacity() {
                return Ok(Some(candidate.clone()));
            }
        }
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // Proofs
    // -----------------------------------------------------------------------

    pub async fn accept_proof(
        &self,
        link_id: &str,
        proof: &ProofSubmission,
    ) -> Result<AdmissionDecision, AdmissionError> {
        if !self.links.contains(link_id) {
            return Ok(self.deny(link_id, DenyReason::NotFound));
        }
        if is_overloaded(self.load.as_ref(), &self.config) {
            return Ok(self.deny(link_id, DenyReason::Overloaded));
        }

        let key = client_key(&proof.client_ip, link_id);
        let message = view_proof_message(link_id, &proof.campaign_id, &key);
        let viewer = recover(&message, &proof.signature).map_err(|_| AdmissionError::BadProof)?;
        if let Some(claimed) = proof.wallet.as_deref() {
            if !addresses_match(claimed, &viewer) {
                return Err(AdmissionError::BadProof);
            }
        }

        if proof.campaign_id == PREMIUM_PROOF {
            if !self.registry.has_premium(&viewer).await? {
                return Err(AdmissionError::NotPremium(viewer));
            }
            return Ok(self.open(link_id, &key, SessionGrant::Premium));
        }

        let campaign = self
            .registry
            .campaign(&proof.campaign_id)
            .await?
            .filter(Campaign::has_capacity)
            .ok_or_else(|| AdmissionError::CampaignUnavailable(proof.campaign_id.clone()))?;

        let decision = self.open(link_id, &key, SessionGrant::Ad(campaign.id.clone()));
        let token = match &decision {
            AdmissionDecision::Granted { token, .. } => token.clone(),
            _ => return Ok(decision),
        };

        let tx = RegistryTransaction::RecordAdView {
            campaign_id: campaign.id.clone(),
            viewer: viewer.clone(),
            link_id: link_id.to_string(),
        };
        match self.registry.submit(tx).await {
            Ok(tx_id) => {
                info!(link = %link_id, campaign = %campaign.id, %viewer, %tx_id, "ad view recorded");
                Ok(decision)
            }
            Err(e) => {
                warn!(link = %link_id, campaign = %campaign.id, error = %e, "ad view not recorded");
                self.sessions.close(&token);
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// A guard for delivering `link_id` under `token`. Fails when the
    /// token is unknown, expired or for another link, or when its session
    /// is already delivering.
    pub fn begin_stream(&self, token: &str, link_id: &str) -> Result<(StreamSession, StreamGuard), ClaimError> {
        let session = self
            .sessions
            .claim(token, link_id, chrono::Utc::now().timestamp())?;
        let guard = StreamGuard::new(self.sessions.clone(), session.token.clone());
        Ok((session, guard))
    }

    /// Sweeps expired sessions until shutdown.
    pub async fn run_sweeper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ended = self.sessions.sweep(chrono::Utc::now().timestamp());
                    if ended > 0 {
                        debug!(ended, "expired sessions swept");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Manifest, MediaType};
    use crate::crypto::keys::NodeKeypair;
    use crate::registry::InMemoryRegistry;
    use crate::streaming::load::FixedLoad;

    const IP: &str = "198.51.100.4";

    struct Fixture {
        admission: StreamAdmission,
        links: Arc<LinkRegistry>,
        registry: Arc<InMemoryRegistry>,
        uploader: NodeKeypair,
        _tmp: tempfile::TempDir,
    }

    fn fixture_with(load: FixedLoad, max_streams: u32, admin: Option<String>) -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let links = Arc::new(LinkRegistry::new(tmp.path()));
        let uploader = NodeKeypair::from_seed(&[3u8; 32]);
        let blob = links.blob_path("l1");
        std::fs::write(&blob, b"x").unwrap();
        links
            .register(RegisteredLink {
                id: "l1".into(),
                file_path: blob,
                manifest: Manifest {
                    id: "l1".into(),
                    media_id: "m1".into(),
                    content_hash: "h".into(),
                    title: "Feature".into(),
                    description: None,
                    media_type: MediaType::Movie,
                    uploader_wallet: uploader.address(),
                    season: None,
                    episode: None,
                    year: None,
                    poster: None,
                    backdrop: None,
                    size: 1,
                    created_at: 0,
                    region: "global".into(),
                    campaign_id: None,
                },
                active_streams: 0,
                max_streams,
                key: None,
                replica: None,
            })
            .unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let admission = StreamAdmission::new(
            links.clone(),
            registry.clone(),
            Arc::new(load),
            AdmissionConfig::default(),
            admin,
        );
        Fixture {
            admission,
            links,
            registry,
            uploader,
            _tmp: tmp,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(FixedLoad::idle(), 2, None)
    }

    fn campaign(id: &str, views: u64) -> Campaign {
        Campaign {
            id: id.into(),
            content_id: format!("ad-{}", id),
            source: "origin".into(),
            title: "Spot".into(),
            active: true,
            views_remaining: views,
            region: "global".into(),
            block: 1,
        }
    }

    fn request(ip: &str) -> AuthorizeRequest {
        AuthorizeRequest {
            client_ip: ip.into(),
            ..AuthorizeRequest::default()
        }
    }

    fn sign_view(kp: &NodeKeypair, campaign: &str, ip: &str) -> RecoverableSignature {
        kp.sign(view_proof_message("l1", campaign, &client_key(ip, "l1")).as_bytes())
    }

    #[tokio::test]
    async fn unknown_link_and_overload_are_denied() {
        let f = fixture();
        assert_eq!(
            f.admission.authorize("nope", &request(IP)).await.unwrap(),
            AdmissionDecision::Denied {
                reason: DenyReason::NotFound
            }
        );

        let busy = fixture_with(
            FixedLoad {
                load: Some(100.0),
                ..FixedLoad::idle()
            },
            2,
            None,
        );
        assert_eq!(
            busy.admission.authorize("l1", &request(IP)).await.unwrap(),
            AdmissionDecision::Denied {
                reason: DenyReason::Overloaded
            }
        );
        assert_eq!(busy.admission.denied(), 1);
    }

    #[tokio::test]
    async fn ad_flow_grants_session_and_records_view() {
        let f = fixture();
        f.registry.put_campaign(campaign("c1", 3));

        let decision = f.admission.authorize("l1", &request(IP)).await.unwrap();
        let AdmissionDecision::RequireProof {
            campaign_id,
            content_id,
            message,
        } = decision
        else {
            panic!("expected proof requirement, got {:?}", decision);
        };
        assert_eq!(campaign_id, "c1");
        assert_eq!(content_id.as_deref(), Some("ad-c1"));
        assert_eq!(message, view_proof_message("l1", "c1", &client_key(IP, "l1")));

        let viewer = NodeKeypair::generate();
        let proof = ProofSubmission {
            client_ip: IP.into(),
            campaign_id: "c1".into(),
            wallet: Some(viewer.address()),
            signature: sign_view(&viewer, "c1", IP),
        };
        let granted = f.admission.accept_proof("l1", &proof).await.unwrap();
        assert!(granted.is_granted());
        assert_eq!(f.links.active_streams("l1"), Some(1));
        assert_eq!(f.registry.submitted().len(), 1);
        assert_eq!(f.registry.campaign("c1").await.unwrap().unwrap().views_remaining, 2);

        // A live session short-circuits the next authorization.
        let again = f.admission.authorize("l1", &request(IP)).await.unwrap();
        assert_eq!(again, granted);
        assert_eq!(f.links.active_streams("l1"), Some(1));
    }

    #[tokio::test]
    async fn no_eligible_campaign_is_denied() {
        let f = fixture();
        f.registry.put_campaign(campaign("empty", 0));
        assert_eq!(
            f.admission.authorize("l1", &request(IP)).await.unwrap(),
            AdmissionDecision::Denied {
                reason: DenyReason::NoAdAvailable
            }
        );
    }

    #[tokio::test]
    async fn proof_for_other_client_is_rejected() {
        let f = fixture();
        f.registry.put_campaign(campaign("c1", 3));
        let viewer = NodeKeypair::generate();
        // Signed for a different client key.
        let proof = ProofSubmission {
            client_ip: IP.into(),
            campaign_id: "c1".into(),
            wallet: None,
            signature: sign_view(&viewer, "c1", "203.0.113.99"),
        };
        assert!(matches!(
            f.admission.accept_proof("l1", &proof).await,
            Err(AdmissionError::BadProof)
        ));

        // Valid signature, but not from the claimed wallet.
        let other = NodeKeypair::generate();
        let claimed = ProofSubmission {
            wallet: Some(other.address()),
            signature: sign_view(&viewer, "c1", IP),
            ..proof
        };
        assert!(matches!(
            f.admission.accept_proof("l1", &claimed).await,
            Err(AdmissionError::BadProof)
        ));
        assert_eq!(f.links.active_streams("l1"), Some(0));
        assert!(f.registry.submitted().is_empty());
    }

    #[tokio::test]
    async fn premium_needs_subscription() {
        let f = fixture();
        let viewer = NodeKeypair::generate();
        let proof = ProofSubmission {
            client_ip: IP.into(),
            campaign_id: PREMIUM_PROOF.into(),
            wallet: Some(viewer.address()),
            signature: sign_view(&viewer, PREMIUM_PROOF, IP),
        };
        assert!(matches!(
            f.admission.accept_proof("l1", &proof).await,
            Err(AdmissionError::NotPremium(_))
        ));

        f.registry.grant_premium(&viewer.address());
        let req = AuthorizeRequest {
            client_ip: IP.into(),
            wallet: Some(viewer.address()),
            signature: None,
        };
        assert!(matches!(
            f.admission.authorize("l1", &req).await.unwrap(),
            AdmissionDecision::RequireProof { ref campaign_id, content_id: None, .. } if campaign_id == PREMIUM_PROOF
        ));
        assert!(f.admission.accept_proof("l1", &proof).await.unwrap().is_granted());
        // Premium views are not billed to a campaign.
        assert!(f.registry.submitted().is_empty());
    }

    #[tokio::test]
    async fn owner_and_admin_are_granted_directly() {
        let admin = NodeKeypair::generate();
        let f = fixture_with(FixedLoad::idle(), 5, Some(admin.address()));

        let owner_req = AuthorizeRequest {
            client_ip: IP.into(),
            wallet: Some(f.uploader.address()),
            signature: Some(sign_view(&f.uploader, OWNER_PROOF, IP)),
        };
        assert!(f.admission.authorize("l1", &owner_req).await.unwrap().is_granted());

        let admin_req = AuthorizeRequest {
            client_ip: "198.51.100.5".into(),
            wallet: None,
            signature: Some(sign_view(&admin, OWNER_PROOF, "198.51.100.5")),
        };
        assert!(f.admission.authorize("l1", &admin_req).await.unwrap().is_granted());

        // A stranger's owner proof falls through to the ad path.
        let stranger = NodeKeypair::generate();
        let stranger_req = AuthorizeRequest {
            client_ip: "198.51.100.6".into(),
            wallet: None,
            signature: Some(sign_view(&stranger, OWNER_PROOF, "198.51.100.6")),
        };
        assert_eq!(
            f.admission.authorize("l1", &stranger_req).await.unwrap(),
            AdmissionDecision::Denied {
                reason: DenyReason::NoAdAvailable
            }
        );
        assert_eq!(f.links.active_streams("l1"), Some(2));
    }

    #[tokio::test]
    async fn cap_denies_new_clients() {
        let f = fixture_with(FixedLoad::idle(), 1, None);
        let owner = |ip: &str| AuthorizeRequest {
            client_ip: ip.into(),
            wallet: None,
            signature: Some(sign_view(&f.uploader, OWNER_PROOF, ip)),
        };
        assert!(f.admission.authorize("l1", &owner("10.0.0.1")).await.unwrap().is_granted());
        assert_eq!(
            f.admission.authorize("l1", &owner("10.0.0.2")).await.unwrap(),
            AdmissionDecision::Denied {
                reason: DenyReason::AtCapacity
            }
        );
    }

    #[tokio::test]
    async fn stream_guard_releases_slot() {
        let f = fixture();
        let req = AuthorizeRequest {
            client_ip: IP.into(),
            wallet: None,
            signature: Some(sign_view(&f.uploader, OWNER_PROOF, IP)),
        };
        let AdmissionDecision::Granted { token, .. } = f.admission.authorize("l1", &req).await.unwrap() else {
            panic!("owner should be granted");
        };
        assert_eq!(f.admission.begin_stream(&token, "other").unwrap_err(), ClaimError::Invalid);

        let (session, guard) = f.admission.begin_stream(&token, "l1").unwrap();
        assert_eq!(session.grant, SessionGrant::Owner);
        assert_eq!(f.links.active_streams("l1"), Some(1));
        assert_eq!(f.admission.begin_stream(&token, "l1").unwrap_err(), ClaimError::InUse);
        drop(guard);
        assert_eq!(f.links.active_streams("l1"), Some(0));
        assert_eq!(f.admission.begin_stream(&token, "l1").unwrap_err(), ClaimError::Invalid);
    }
}
