//! Opportunity filtering, relevance ranking and recommendations.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use volmatch_core::{
    normalize_tag, normalized_tags_related, parse_calendar_date, tags_equal, Opportunity,
    OpportunityId, ProfileTags, TagCatalog,
};
use volmatch_storage::{
    FavoritesStore, FetchError, FileStore, HttpClientConfig, HttpFetcher, KeyValueStore,
    ProfileStore, SignalBus,
};

pub const CRATE_NAME: &str = "volmatch-ranking";

/// Query value meaning "no restriction" for location/skill/interest choices.
pub const ALL_CHOICE: &str = "all";

#[derive(Debug, Clone)]
pub struct RankingConfig {
    pub catalog_path: PathBuf,
    pub state_dir: PathBuf,
    pub oracle_url: Option<String>,
    pub tagger_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub oracle_timeout_secs: u64,
    pub local_fallback: bool,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            catalog_path: PathBuf::from("./catalog.yaml"),
            state_dir: PathBuf::from("./state"),
            oracle_url: None,
            tagger_url: "http://127.0.0.1:8000/get-tags".to_string(),
            user_agent: "volmatch/0.1".to_string(),
            http_timeout_secs: 20,
            oracle_timeout_secs: 10,
            local_fallback: true,
        }
    }
}

impl RankingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            catalog_path: std::env::var("VOLMATCH_CATALOG_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_path),
            state_dir: std::env::var("VOLMATCH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            oracle_url: std::env::var("VOLMATCH_ORACLE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            tagger_url: std::env::var("VOLMATCH_TAGGER_URL").unwrap_or(defaults.tagger_url),
            user_agent: std::env::var("VOLMATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("VOLMATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            oracle_timeout_secs: std::env::var("VOLMATCH_ORACLE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.oracle_timeout_secs),
            local_fallback: std::env::var("VOLMATCH_LOCAL_FALLBACK")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(defaults.local_fallback),
        }
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_secs(self.oracle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    opportunities: Vec<Opportunity>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid catalog yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("opportunity id {0} appears more than once")]
    DuplicateId(OpportunityId),
}

pub fn parse_catalog(yaml: &str) -> Result<Vec<Opportunity>, CatalogError> {
    let file: CatalogFile = serde_yaml::from_str(yaml)?;
    let mut seen = HashSet::new();
    for opportunity in &file.opportunities {
        if !seen.insert(opportunity.id) {
            return Err(CatalogError::DuplicateId(opportunity.id));
        }
    }
    Ok(file.opportunities)
}

pub fn load_catalog(path: &Path) -> Result<Vec<Opportunity>> {
    let yaml = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog {}", path.display()))?;
    parse_catalog(&yaml).with_context(|| format!("parsing catalog {}", path.display()))
}

/// One line per opportunity, numbered from 1: `"3. Event Volunteer - Community Center"`.
pub fn catalog_listing(catalog: &[Opportunity]) -> String {
    catalog
        .iter()
        .enumerate()
        .map(|(idx, o)| format!("{}. {} - {}", idx + 1, o.title, o.location))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Per-view filter inputs. `None` choices and empty text mean "no restriction".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterState {
    pub search: String,
    pub location: Option<String>,
    pub skill: Option<String>,
    pub interest: Option<String>,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl FilterState {
    pub fn is_manual(&self) -> bool {
        !self.search.trim().is_empty()
            || active_choice(&self.location).is_some()
            || active_choice(&self.skill).is_some()
            || active_choice(&self.interest).is_some()
            || self.start.is_some()
            || self.end.is_some()
    }
}

fn active_choice(choice: &Option<String>) -> Option<&str> {
    choice
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case(ALL_CHOICE))
}

/// Raw, untyped filter parameters as they arrive from a query string or CLI.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterQuery {
    pub search: Option<String>,
    pub location: Option<String>,
    pub skill: Option<String>,
    pub interest: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl FilterQuery {
    /// Unparsable date bounds are treated as open.
    pub fn into_filter(self) -> FilterState {
        let bound = |raw: Option<String>| {
            let raw = raw?;
            let parsed = parse_calendar_date(&raw);
            if parsed.is_none() && !raw.trim().is_empty() {
                debug!(bound = %raw, "ignoring unparsable date bound");
            }
            parsed
        };
        FilterState {
            search: self.search.unwrap_or_default(),
            location: active_choice(&self.location).map(str::to_string),
            skill: active_choice(&self.skill).map(str::to_string),
            interest: active_choice(&self.interest).map(str::to_string),
            start: bound(self.start),
            end: bound(self.end),
        }
    }
}

/// Which predicate family governs a ranking pass. Chosen once per pass:
/// manual filters and the implicit profile match never combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    ManualFilter,
    ImplicitProfileMatch,
}

impl FilterMode {
    pub fn select(filter: &FilterState) -> Self {
        if filter.is_manual() {
            Self::ManualFilter
        } else {
            Self::ImplicitProfileMatch
        }
    }
}

pub fn matches(opportunity: &Opportunity, filter: &FilterState, profile: &ProfileTags) -> bool {
    matches_in_mode(FilterMode::select(filter), opportunity, filter, profile)
}

pub fn matches_in_mode(
    mode: FilterMode,
    opportunity: &Opportunity,
    filter: &FilterState,
    profile: &ProfileTags,
) -> bool {
    match mode {
        FilterMode::ManualFilter => {
            matches_search(opportunity, &filter.search)
                && matches_location(opportunity, &filter.location)
                && matches_skill(opportunity, &filter.skill)
                && matches_interest(opportunity, &filter.interest)
                && matches_date_range(opportunity, filter.start, filter.end)
        }
        FilterMode::ImplicitProfileMatch => matches_profile(opportunity, profile),
    }
}

pub fn matches_search(opportunity: &Opportunity, search: &str) -> bool {
    let needle = search.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    opportunity.title.to_lowercase().contains(&needle)
        || opportunity.description.to_lowercase().contains(&needle)
        || opportunity
            .skills
            .iter()
            .any(|skill| skill.to_lowercase().contains(&needle))
}

pub fn matches_location(opportunity: &Opportunity, location: &Option<String>) -> bool {
    active_choice(location).map_or(true, |wanted| opportunity.location == wanted)
}

pub fn matches_skill(opportunity: &Opportunity, skill: &Option<String>) -> bool {
    active_choice(skill).map_or(true, |wanted| {
        opportunity.skills.iter().any(|s| tags_equal(s, wanted))
    })
}

pub fn matches_interest(opportunity: &Opportunity, interest: &Option<String>) -> bool {
    active_choice(interest).map_or(true, |wanted| {
        opportunity.interests.iter().any(|i| tags_equal(i, wanted))
    })
}

/// Undated opportunities always pass; bounds are inclusive and either may be open.
pub fn matches_date_range(
    opportunity: &Opportunity,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> bool {
    let Some(date) = opportunity.start_date else {
        return true;
    };
    start.map_or(true, |s| date >= s) && end.map_or(true, |e| date <= e)
}

/// Vacuously true for an empty profile so nothing gets hidden.
pub fn matches_profile(opportunity: &Opportunity, profile: &ProfileTags) -> bool {
    if profile.is_empty() {
        return true;
    }
    any_related(&opportunity.normalized_interests(), &profile.interests.normalized())
        || any_related(&opportunity.normalized_skills(), &profile.skills.normalized())
}

fn any_related(own: &[String], wanted: &[String]) -> bool {
    own.iter()
        .any(|tag| wanted.iter().any(|w| normalized_tags_related(tag, w)))
}

/// Coarse relevance bucket; lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankingCategory {
    /// Covers every declared interest and lists nothing beyond them.
    Exact = 0,
    /// Some overlap, or the user declared no interests.
    Partial = 1,
    Unrelated = 2,
}

/// Ordering key: category ascending, overlap descending, catalog index ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RankKey {
    pub category: RankingCategory,
    pub overlap: usize,
    pub index: usize,
}

impl Ord for RankKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.category
            .cmp(&other.category)
            .then_with(|| other.overlap.cmp(&self.overlap))
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for RankKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    interests: Vec<String>,
}

impl RelevanceScorer {
    pub fn new(profile: &ProfileTags) -> Self {
        Self {
            interests: profile.interests.normalized(),
        }
    }

    pub fn key(&self, index: usize, opportunity: &Opportunity) -> RankKey {
        let own = opportunity
            .normalized_interests()
            .into_iter()
            .filter(|tag| !tag.is_empty())
            .collect::<BTreeSet<_>>();
        let overlap = own
            .iter()
            .filter(|tag| self.interests.iter().any(|w| normalized_tags_related(tag, w)))
            .count();

        let covers_profile = self
            .interests
            .iter()
            .all(|w| own.iter().any(|tag| normalized_tags_related(tag, w)));

        let category = if self.interests.is_empty() {
            RankingCategory::Partial
        } else if overlap > 0 && overlap == own.len() && covers_profile {
            RankingCategory::Exact
        } else if overlap > 0 {
            RankingCategory::Partial
        } else {
            RankingCategory::Unrelated
        };

        RankKey {
            category,
            overlap,
            index,
        }
    }

    pub fn category(&self, opportunity: &Opportunity) -> RankingCategory {
        self.key(0, opportunity).category
    }
}

/// Filter then order the catalog for one view.
pub fn rank<'a>(
    catalog: &'a [Opportunity],
    profile: &ProfileTags,
    filter: &FilterState,
) -> Vec<&'a Opportunity> {
    let mode = FilterMode::select(filter);
    let scorer = RelevanceScorer::new(profile);
    let mut keyed = catalog
        .iter()
        .enumerate()
        .filter(|(_, o)| matches_in_mode(mode, o, filter, profile))
        .map(|(idx, o)| (scorer.key(idx, o), o))
        .collect::<Vec<_>>();
    keyed.sort_by_key(|(key, _)| *key);
    keyed.into_iter().map(|(_, o)| o).collect()
}

/// Degraded, always-available recommender: most declared-interest matches first,
/// catalog order among equals.
pub fn local_recommendations(interests: &[String], catalog: &[Opportunity]) -> Vec<Opportunity> {
    let wanted = interests
        .iter()
        .map(|i| normalize_tag(i))
        .filter(|i| !i.is_empty())
        .collect::<Vec<_>>();
    let mut scored = catalog
        .iter()
        .map(|o| {
            let own = o.normalized_interests();
            let score = wanted
                .iter()
                .filter(|w| own.iter().any(|tag| normalized_tags_related(tag, w)))
                .count();
            (score, o)
        })
        .collect::<Vec<_>>();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, o)| o.clone()).collect()
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("empty response body")]
    EmptyBody,
    #[error("response is not json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("expected a json array of catalog positions")]
    NotAnArray,
    #[error("catalog position {position} is outside 1..={len}")]
    OutOfRange { position: i64, len: usize },
    #[error("ranking named no catalog positions")]
    EmptyRanking,
    #[error("no ranking within {0:?}")]
    Timeout(Duration),
}

/// Remote ranking service treated as a black box.
#[async_trait]
pub trait RecommendationOracle: Send + Sync {
    /// Best-first ranking of `catalog` for `interests`.
    async fn rank(
        &self,
        interests: &[String],
        catalog: &[Opportunity],
    ) -> Result<Vec<Opportunity>, OracleError>;
}

/// Maps a JSON array of 1-based catalog positions back to opportunities, in
/// the order given. Non-integer entries and repeats are dropped; a position
/// outside the catalog rejects the whole response.
pub fn parse_ranking_response(
    body: &[u8],
    catalog: &[Opportunity],
) -> Result<Vec<Opportunity>, OracleError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(OracleError::EmptyBody);
    }
    let value: JsonValue = serde_json::from_slice(body)?;
    let positions = value.as_array().ok_or(OracleError::NotAnArray)?;

    let mut seen = HashSet::new();
    let mut ranked = Vec::new();
    for item in positions {
        let position = item
            .as_i64()
            .or_else(|| item.as_str().and_then(|s| s.trim().parse().ok()));
        let Some(position) = position else {
            debug!(%item, "dropping unmapped ranking entry");
            continue;
        };
        if position < 1 || position as usize > catalog.len() {
            return Err(OracleError::OutOfRange {
                position,
                len: catalog.len(),
            });
        }
        if seen.insert(position) {
            ranked.push(catalog[(position - 1) as usize].clone());
        }
    }

    if ranked.is_empty() {
        return Err(OracleError::EmptyRanking);
    }
    Ok(ranked)
}

pub fn ranking_prompt(interests: &[String], catalog: &[Opportunity]) -> String {
    format!(
        "A volunteer is interested in: {}.\n\
         Rank the following opportunities from best to worst match. \
         Answer only with a JSON array of their numbers.\n{}",
        interests.join(", "),
        catalog_listing(catalog)
    )
}

#[derive(Debug, Serialize)]
pub struct RankingRequest<'a> {
    pub interests: &'a [String],
    pub prompt: String,
}

pub struct HttpRecommendationOracle {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl HttpRecommendationOracle {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl RecommendationOracle for HttpRecommendationOracle {
    async fn rank(
        &self,
        interests: &[String],
        catalog: &[Opportunity],
    ) -> Result<Vec<Opportunity>, OracleError> {
        let request = RankingRequest {
            interests,
            prompt: ranking_prompt(interests, catalog),
        };
        let response = self.http.post_json(&self.endpoint, &request).await?;
        parse_ranking_response(&response.body, catalog)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RankingSource {
    Oracle,
    Local,
    LocalFallback { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendations {
    pub opportunities: Vec<Opportunity>,
    pub source: RankingSource,
}

#[derive(Debug, Error)]
pub enum RecommendError {
    #[error("recommendation oracle failed: {0}")]
    Oracle(#[from] OracleError),
}

/// Catalog owner: the filter/sort path for browsing and the separate
/// "recommended for you" path.
pub struct OpportunityRanker {
    catalog: Vec<Opportunity>,
    tags: TagCatalog,
    oracle: Option<Arc<dyn RecommendationOracle>>,
    oracle_timeout: Duration,
    local_fallback: bool,
}

impl OpportunityRanker {
    pub fn new(catalog: Vec<Opportunity>) -> Self {
        let tags = TagCatalog::from_opportunities(&catalog);
        Self {
            catalog,
            tags,
            oracle: None,
            oracle_timeout: RankingConfig::default().oracle_timeout(),
            local_fallback: true,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn RecommendationOracle>, timeout: Duration) -> Self {
        self.oracle = Some(oracle);
        self.oracle_timeout = timeout;
        self
    }

    pub fn with_local_fallback(mut self, enabled: bool) -> Self {
        self.local_fallback = enabled;
        self
    }

    pub fn catalog(&self) -> &[Opportunity] {
        &self.catalog
    }

    pub fn tags(&self) -> &TagCatalog {
        &self.tags
    }

    pub fn find(&self, id: OpportunityId) -> Option<&Opportunity> {
        self.catalog.iter().find(|o| o.id == id)
    }

    pub fn rank(&self, profile: &ProfileTags, filter: &FilterState) -> Vec<&Opportunity> {
        rank(&self.catalog, profile, filter)
    }

    pub async fn recommend(&self, profile: &ProfileTags) -> Result<Recommendations, RecommendError> {
        self.recommend_for(profile.interests.labels()).await
    }

    /// Asks the oracle within the configured time bound; any failure degrades
    /// to the local recommender unless fallback is disabled.
    pub async fn recommend_for(&self, interests: &[String]) -> Result<Recommendations, RecommendError> {
        let oracle = match &self.oracle {
            Some(oracle) if !interests.is_empty() => oracle,
            _ => {
                return Ok(Recommendations {
                    opportunities: local_recommendations(interests, &self.catalog),
                    source: RankingSource::Local,
                })
            }
        };

        let outcome = tokio::time::timeout(self.oracle_timeout, oracle.rank(interests, &self.catalog))
            .await
            .unwrap_or(Err(OracleError::Timeout(self.oracle_timeout)));

        match outcome {
            Ok(opportunities) => Ok(Recommendations {
                opportunities,
                source: RankingSource::Oracle,
            }),
            Err(err) if self.local_fallback => {
                warn!(error = %err, "recommendation oracle failed; using local ranking");
                Ok(Recommendations {
                    opportunities: local_recommendations(interests, &self.catalog),
                    source: RankingSource::LocalFallback {
                        reason: err.to_string(),
                    },
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FeedState {
    Idle,
    Loading {
        generation: u64,
    },
    Settled {
        generation: u64,
        recommendations: Recommendations,
    },
    Failed {
        generation: u64,
        reason: String,
    },
}

/// Identity of one issued recommendation request plus the interests it was
/// issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTicket {
    generation: u64,
    interests: Vec<String>,
}

impl RequestTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn interests(&self) -> &[String] {
        &self.interests
    }
}

/// Loading/settled/failed state of the "recommended for you" view. The most
/// recently issued request wins; older responses are dropped on arrival.
pub struct RecommendationFeed {
    ranker: Arc<OpportunityRanker>,
    latest: AtomicU64,
    state: watch::Sender<FeedState>,
}

impl RecommendationFeed {
    pub fn new(ranker: Arc<OpportunityRanker>) -> Self {
        let (state, _) = watch::channel(FeedState::Idle);
        Self {
            ranker,
            latest: AtomicU64::new(0),
            state,
        }
    }

    pub fn issue(&self, profile: &ProfileTags) -> RequestTicket {
        let mut generation = 0;
        self.state.send_modify(|state| {
            generation = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
            *state = FeedState::Loading { generation };
        });
        RequestTicket {
            generation,
            interests: profile.interests.labels().to_vec(),
        }
    }

    pub fn is_current(&self, ticket: &RequestTicket) -> bool {
        self.latest.load(Ordering::SeqCst) == ticket.generation
    }

    /// Applies `outcome` only if `ticket` is still the latest request.
    pub fn settle(
        &self,
        ticket: &RequestTicket,
        outcome: Result<Recommendations, RecommendError>,
    ) -> bool {
        let generation = ticket.generation;
        let mut outcome = Some(outcome);
        let applied = self.state.send_if_modified(|state| {
            if !self.is_current(ticket) {
                return false;
            }
            *state = match outcome.take() {
                Some(Ok(recommendations)) => FeedState::Settled {
                    generation,
                    recommendations,
                },
                Some(Err(err)) => FeedState::Failed {
                    generation,
                    reason: err.to_string(),
                },
                None => return false,
            };
            true
        });
        if !applied {
            debug!(
                generation,
                latest = self.latest.load(Ordering::SeqCst),
                "discarding superseded recommendation response"
            );
        }
        applied
    }

    /// Issues a request for `profile`, waits for it and settles it. Returns
    /// whether the result was applied.
    pub async fn refresh(&self, profile: &ProfileTags) -> bool {
        let ticket = self.issue(profile);
        let outcome = self.ranker.recommend_for(ticket.interests()).await;
        self.settle(&ticket, outcome)
    }

    pub fn state(&self) -> FeedState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }
}

/// Free-text quiz answers to be turned into profile tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuizAnswers {
    #[serde(default)]
    pub interests: String,
    #[serde(default)]
    pub skills: String,
}

impl QuizAnswers {
    pub fn description(&self) -> Result<String, QuizError> {
        let interests = self.interests.trim();
        if interests.is_empty() {
            return Err(QuizError::MissingInterests);
        }
        Ok(format!("Interests: {} Skills: {}", interests, self.skills.trim()))
    }
}

#[derive(Debug, Error)]
pub enum QuizError {
    #[error("Please fill in the interests field before finding matches.")]
    MissingInterests,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("tagging service returned an unreadable body: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct TagPayload {
    interests: Vec<String>,
    skills: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagEnvelope {
    Wrapped { tags: TagPayload },
    Bare(TagPayload),
}

/// Accepts `{ "tags": { interests, skills } }` or the unwrapped payload.
pub fn parse_tag_response(body: &[u8]) -> Result<ProfileTags, QuizError> {
    let envelope: TagEnvelope =
        serde_json::from_slice(body).map_err(|err| QuizError::Malformed(err.to_string()))?;
    let payload = match envelope {
        TagEnvelope::Wrapped { tags } | TagEnvelope::Bare(tags) => tags,
    };
    Ok(ProfileTags {
        interests: payload.interests.into_iter().collect(),
        skills: payload.skills.into_iter().collect(),
    })
}

#[derive(Debug, Serialize)]
struct TagRequest<'a> {
    description: &'a str,
}

pub struct TaggingClient {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl TaggingClient {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    /// Validates the answers before any request is made.
    pub async fn suggest_tags(&self, answers: &QuizAnswers) -> Result<ProfileTags, QuizError> {
        let description = answers.description()?;
        let response = self
            .http
            .post_json(&self.endpoint, &TagRequest {
                description: &description,
            })
            .await?;
        parse_tag_response(&response.body)
    }
}

/// Everything a front end needs, wired from config.
pub struct MatchEngine {
    pub config: RankingConfig,
    pub ranker: Arc<OpportunityRanker>,
    pub feed: Arc<RecommendationFeed>,
    pub favorites: FavoritesStore,
    pub profiles: ProfileStore,
    pub tagger: TaggingClient,
}

impl MatchEngine {
    pub fn from_env() -> Result<Self> {
        Self::from_config(RankingConfig::from_env())
    }

    pub fn from_config(config: RankingConfig) -> Result<Self> {
        let catalog = load_catalog(&config.catalog_path)?;
        let backend: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(config.state_dir.clone()));
        Self::assemble(config, catalog, backend)
    }

    pub fn assemble(
        config: RankingConfig,
        catalog: Vec<Opportunity>,
        backend: Arc<dyn KeyValueStore>,
    ) -> Result<Self> {
        let http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })
            .context("building http client")?,
        );

        let mut ranker =
            OpportunityRanker::new(catalog).with_local_fallback(config.local_fallback);
        if let Some(url) = &config.oracle_url {
            ranker = ranker.with_oracle(
                Arc::new(HttpRecommendationOracle::new(http.clone(), url.clone())),
                config.oracle_timeout(),
            );
        }
        let ranker = Arc::new(ranker);

        let bus = SignalBus::new();
        let engine = Self {
            feed: Arc::new(RecommendationFeed::new(ranker.clone())),
            favorites: FavoritesStore::new(backend.clone(), &bus),
            profiles: ProfileStore::new(backend, &bus),
            tagger: TaggingClient::new(http, config.tagger_url.clone()),
            ranker,
            config,
        };
        info!(
            opportunities = engine.ranker.catalog().len(),
            oracle = engine.config.oracle_url.is_some(),
            "match engine ready"
        );
        Ok(engine)
    }
}
