//! Axum JSON API over the match engine.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use volmatch_core::{Opportunity, OpportunityId, Profile, ProfileTags, DEFAULT_PROFILE_NAME};
use volmatch_ranking::{
    FeedState, FilterMode, FilterQuery, MatchEngine, QuizAnswers, QuizError, RankingCategory,
    RelevanceScorer,
};
use volmatch_storage::FavoriteSet;

pub const CRATE_NAME: &str = "volmatch-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MatchEngine>,
}

impl AppState {
    pub fn new(engine: MatchEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RankedOpportunity<'a> {
    #[serde(flatten)]
    opportunity: &'a Opportunity,
    organizer_label: &'a str,
    category: RankingCategory,
    favorite: bool,
}

#[derive(Debug, Serialize)]
struct OpportunityList<'a> {
    mode: FilterMode,
    total: usize,
    opportunities: Vec<RankedOpportunity<'a>>,
}

#[derive(Debug, Serialize)]
struct FavoriteToggle<'a> {
    id: OpportunityId,
    favorite: bool,
    favorites: &'a FavoriteSet,
}

#[derive(Debug, Serialize)]
struct QuizOutcome {
    suggested: ProfileTags,
    added: usize,
    profile: Profile,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/opportunities", get(opportunities_handler))
        .route("/api/opportunities/{id}", get(opportunity_detail_handler))
        .route("/api/tags", get(tags_handler))
        .route("/api/profile", get(profile_handler).put(profile_update_handler))
        .route("/api/profile/clear", post(profile_clear_handler))
        .route("/api/quiz", post(quiz_handler))
        .route("/api/favorites", get(favorites_handler))
        .route("/api/favorites/{id}/toggle", post(favorite_toggle_handler))
        .route("/api/recommendations", get(recommendations_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("VOLMATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080)
}

pub async fn serve(engine: MatchEngine, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "volmatch api listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(MatchEngine::from_env()?, port_from_env()).await
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilterQuery>,
) -> Response {
    let engine = &state.engine;
    let profile = engine.profiles.load().await;
    let favorites = engine.favorites.load().await;
    let filter = query.into_filter();

    let scorer = RelevanceScorer::new(&profile.tags);
    let opportunities = engine
        .ranker
        .rank(&profile.tags, &filter)
        .into_iter()
        .map(|opportunity| RankedOpportunity {
            organizer_label: opportunity.organizer_label(),
            category: scorer.category(opportunity),
            favorite: favorites.contains(opportunity.id),
            opportunity,
        })
        .collect::<Vec<_>>();

    Json(OpportunityList {
        mode: FilterMode::select(&filter),
        total: opportunities.len(),
        opportunities,
    })
    .into_response()
}

async fn opportunity_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_id): AxumPath<String>,
) -> Response {
    let id = match raw_id.parse::<OpportunityId>() {
        Ok(id) => id,
        Err(err) => return bad_request(err.to_string()),
    };
    let engine = &state.engine;
    let Some(opportunity) = engine.ranker.find(id) else {
        return not_found(id);
    };
    let profile = engine.profiles.load().await;
    let favorite = engine.favorites.load().await.contains(id);
    Json(RankedOpportunity {
        organizer_label: opportunity.organizer_label(),
        category: RelevanceScorer::new(&profile.tags).category(opportunity),
        favorite,
        opportunity,
    })
    .into_response()
}

async fn tags_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.ranker.tags()).into_response()
}

async fn profile_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.profiles.load().await).into_response()
}

async fn profile_update_handler(
    State(state): State<Arc<AppState>>,
    Json(mut profile): Json<Profile>,
) -> Response {
    let name = profile.name.trim();
    profile.name = if name.is_empty() {
        DEFAULT_PROFILE_NAME.to_string()
    } else {
        name.to_string()
    };
    match state.engine.profiles.save(&profile).await {
        Ok(()) => Json(profile).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn profile_clear_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.profiles.clear_tags().await {
        Ok(profile) => Json(profile).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn quiz_handler(
    State(state): State<Arc<AppState>>,
    Json(answers): Json<QuizAnswers>,
) -> Response {
    let engine = &state.engine;
    let suggested = match engine.tagger.suggest_tags(&answers).await {
        Ok(tags) => tags,
        Err(err @ QuizError::MissingInterests) => return bad_request(err.to_string()),
        Err(err) => {
            warn!(error = %err, "tagging service failed");
            return error_json(StatusCode::BAD_GATEWAY, err.to_string());
        }
    };
    match engine.profiles.merge_tags(&suggested).await {
        Ok((profile, added)) => Json(QuizOutcome {
            suggested,
            added,
            profile,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn favorites_handler(State(state): State<Arc<AppState>>) -> Response {
    let engine = &state.engine;
    let favorites = engine.favorites.load().await;
    let opportunities = favorites
        .ids()
        .iter()
        .filter_map(|id| engine.ranker.find(*id))
        .collect::<Vec<_>>();
    Json(json!({ "ids": favorites, "opportunities": opportunities })).into_response()
}

async fn favorite_toggle_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_id): AxumPath<String>,
) -> Response {
    let id = match raw_id.parse::<OpportunityId>() {
        Ok(id) => id,
        Err(err) => return bad_request(err.to_string()),
    };
    if state.engine.ranker.find(id).is_none() {
        return not_found(id);
    }
    match state.engine.favorites.toggle(id).await {
        Ok(favorites) => Json(FavoriteToggle {
            id,
            favorite: favorites.contains(id),
            favorites: &favorites,
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn recommendations_handler(State(state): State<Arc<AppState>>) -> Response {
    let engine = &state.engine;
    let profile = engine.profiles.load().await;
    if !engine.feed.refresh(&profile.tags).await {
        // Superseded by a newer request; report that one once it settles.
        let mut feed = engine.feed.subscribe();
        let settled = feed
            .wait_for(|state| !matches!(state, FeedState::Loading { .. }))
            .await
            .map(|_| ());
        if let Err(err) = settled {
            return server_error(err.into());
        }
    }
    Json(engine.feed.state()).into_response()
}

fn error_json(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn bad_request(message: String) -> Response {
    error_json(StatusCode::BAD_REQUEST, message)
}

fn not_found(id: OpportunityId) -> Response {
    error_json(StatusCode::NOT_FOUND, format!("opportunity {id} not found"))
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "request failed");
    error_json(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err}"))
}
