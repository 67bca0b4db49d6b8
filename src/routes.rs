// src/routes.rs

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    handlers::{admin, session, violation},
    state::AppState,
    utils::jwt::{admin_middleware, auth_middleware},
};

/// Assembles the main application router.
///
/// * Participant routes (session content, progress, violations, result).
/// * Proctor/grader routes under `/api/admin`.
/// * Applies global middleware (Trace, CORS).
/// * Injects global state (Database Pool, Config).
pub fn create_router(state: AppState) -> Router {
    let origins = [
        HeaderValue::from_static("http://localhost:3000"),
        HeaderValue::from_static("http://127.0.0.1:3000"),
    ];

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    let participant_routes = Router::new()
        .route("/exams/{exam_id}/session", get(session::open_session))
        .route("/sessions/{session_id}/progress", put(session::save_progress))
        .route(
            "/sessions/{session_id}/violations",
            post(violation::report_violation),
        )
        .route("/sessions/{session_id}/result", get(session::get_result))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    let admin_routes = Router::new()
        .route(
            "/sessions/{session_id}/unlock",
            post(admin::unlock_session),
        )
        .route(
            "/sessions/{session_id}/violations",
            get(admin::list_session_violations),
        )
        .route(
            "/sessions/{session_id}/scores/{question_id}",
            put(admin::grade_question),
        )
        .route("/exams/{exam_id}/sessions", get(admin::list_exam_sessions))
        // Double middleware protection: Auth first, then Admin check
        .layer(middleware::from_fn(admin_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware));

    Router::new()
        .nest("/api", participant_routes)
        .nest("/api/admin", admin_routes)
        // Global Middleware (applied from outside in)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
