//! HTTP handler functions for the compliance map API.

use std::sync::Arc;

use actix_web::{HttpResponse, web};
use chrono::Utc;
use compliance_map_alerts::{evaluate as evaluate_readings, expiry_window, merge_alerts};
use compliance_map_cache::{CacheState, SourceCache};
use compliance_map_server_models::{
    ApiBuildTriggered, ApiError, ApiEvaluateRequest, ApiEvaluateResponse, ApiHealth, ApiLookup,
    ApiRegion, LookupParams,
};

use crate::AppState;

/// Looks up a source's cache or produces the 404 response.
fn source_cache<'a>(state: &'a AppState, id: &str) -> Result<&'a Arc<SourceCache>, HttpResponse> {
    state
        .caches
        .get(id)
        .ok_or_else(|| HttpResponse::NotFound().json(ApiError::new(format!("Unknown source: {id}"))))
}

fn valid_coords(params: LookupParams) -> bool {
    params.lat.is_finite()
        && params.lng.is_finite()
        && (-90.0..=90.0).contains(&params.lat)
        && (-180.0..=180.0).contains(&params.lng)
}

/// `GET /api/health`
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiHealth {
        healthy: true,
        version: env!("CARGO_PKG_VERSION").to_string(),
        sources: state.caches.len(),
    })
}

/// `GET /api/sources`
///
/// Status of every source. Never triggers warm-up or builds.
pub async fn sources(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.caches.statuses())
}

/// `GET /api/sources/{id}/status`
pub async fn status(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    match source_cache(&state, &path) {
        Ok(cache) => HttpResponse::Ok().json(cache.status()),
        Err(response) => response,
    }
}

/// `GET /api/sources/{id}/lookup?lat=&lng=`
///
/// Entities near the point with a location grade. A cold source answers
/// `status: "cold"` immediately and starts building.
pub async fn lookup(
    state: web::Data<AppState>,
    path: web::Path<String>,
    params: web::Query<LookupParams>,
) -> HttpResponse {
    let cache = match source_cache(&state, &path) {
        Ok(cache) => cache,
        Err(response) => return response,
    };
    let params = params.into_inner();
    if !valid_coords(params) {
        return HttpResponse::BadRequest().json(ApiError::new(format!(
            "Invalid coordinates: {}, {}",
            params.lat, params.lng
        )));
    }

    let result = cache.lookup(params.lat, params.lng).await;
    HttpResponse::Ok().json(ApiLookup::new(result, cache.status()))
}

/// `GET /api/sources/{id}/regions/{code}`
pub async fn region(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (id, code) = path.into_inner();
    let cache = match source_cache(&state, &id) {
        Ok(cache) => cache,
        Err(response) => return response,
    };
    let code = code.to_ascii_uppercase();
    if !cache.definition().region_codes().contains(&code) {
        return HttpResponse::NotFound().json(ApiError::new(format!(
            "Source {id} does not cover region {code}"
        )));
    }

    let Some(entities) = cache.region(&code).await else {
        return HttpResponse::ServiceUnavailable()
            .json(ApiError::new(format!("Source {id} is still building")));
    };
    let missing = cache.status().missing_regions.contains(&code);

    HttpResponse::Ok().json(ApiRegion {
        source: id,
        region: code,
        missing,
        entities,
    })
}

/// `GET /api/sources/{id}/entities/{entity_id}`
pub async fn entity(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
) -> HttpResponse {
    let (id, entity_id) = path.into_inner();
    let cache = match source_cache(&state, &id) {
        Ok(cache) => cache,
        Err(response) => return response,
    };

    match cache.entity(&entity_id).await {
        Some(entity) => HttpResponse::Ok().json(entity),
        None if cache.resident().is_none() => HttpResponse::ServiceUnavailable()
            .json(ApiError::new(format!("Source {id} is still building"))),
        None => HttpResponse::NotFound().json(ApiError::new(format!(
            "No entity {entity_id} in {id}"
        ))),
    }
}

/// `POST /api/sources/{id}/build`
///
/// Starts a background build, or joins the running one.
pub async fn build(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let cache = match source_cache(&state, &path) {
        Ok(cache) => cache,
        Err(response) => return response,
    };

    let started = cache.status().state != CacheState::Building;
    drop(cache.trigger_build());
    log::info!(
        "{}: build {} via API",
        cache.id(),
        if started { "started" } else { "joined" }
    );

    HttpResponse::Accepted().json(ApiBuildTriggered {
        source: cache.id().to_string(),
        started,
        cache: cache.status(),
    })
}

/// `POST /api/alerts/evaluate`
///
/// Evaluates readings and merges the fired alerts into `existing`.
pub async fn evaluate(
    state: web::Data<AppState>,
    body: web::Json<ApiEvaluateRequest>,
) -> HttpResponse {
    let request = body.into_inner();
    let now = Utc::now();
    let fired = evaluate_readings(
        &request.readings,
        &state.rules,
        &request.site_names,
        &request.site_states,
        now,
    );
    let merged = merge_alerts(request.existing, fired.clone(), now, expiry_window());

    HttpResponse::Ok().json(ApiEvaluateResponse { fired, merged })
}
