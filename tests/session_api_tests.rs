// tests/session_api_tests.rs

//! End-to-end tests against a live Postgres.
//! Each test seeds its own exam, so they can share one database.
//! Skipped when DATABASE_URL is not set.

use std::time::Duration;

use chrono::{DateTime, Utc};
use proctor::{
    config::Config,
    engine::{
        EngineConfig, PersistenceBridge, SessionOutcome, SessionRunner, remote::HttpRemote,
        runner::ClientEvent, stash::MemoryStash,
    },
    routes,
    state::AppState,
    utils::jwt::{Role, sign_jwt},
};
use serde_json::{Value, json};
use sqlx::{PgPool, postgres::PgPoolOptions};

const SECRET: &str = "session_test_secret";
const ADMIN_ID: i64 = 1;

/// Spawns the app on a random port.
/// Returns the base URL and a pool for seeding, or `None` without a database.
async fn spawn_app() -> Option<(String, PgPool)> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping database-backed test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to Postgres for testing.");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to migrate database");

    let config = Config {
        database_url: database_url.clone(),
        jwt_secret: SECRET.to_string(),
        rust_log: "error".to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        violation_lock_threshold: 5,
        late_submission_grace_secs: 30,
    };

    let state = AppState {
        pool: pool.clone(),
        config,
    };
    let app = routes::create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let address = format!("http://127.0.0.1:{}", port);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Some((address, pool))
}

fn participant_token(id: i64) -> String {
    sign_jwt(id, Role::Participant, SECRET, 600).unwrap()
}

fn admin_token() -> String {
    sign_jwt(ADMIN_ID, Role::Proctor, SECRET, 600).unwrap()
}

struct SeededExam {
    id: i64,
    objective_a: i64,
    objective_b: i64,
    essay: i64,
}

/// Seeds an exam with two objective questions (3 and 2 points) and one
/// subjective question worth 5.
async fn seed_exam(
    pool: &PgPool,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    access_token: Option<&str>,
) -> SeededExam {
    let title = format!("exam_{}", &uuid::Uuid::new_v4().to_string()[..8]);
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO exams (title, duration_minutes, start_time, end_time, access_token)
        VALUES ($1, 60, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(&title)
    .bind(start_time)
    .bind(end_time)
    .bind(access_token)
    .fetch_one(pool)
    .await
    .unwrap();

    let choices = json!([
        { "label": "A", "text": "Alpha" },
        { "label": "B", "text": "Beta" },
        { "label": "C", "text": "Gamma" }
    ]);

    let mut ids = Vec::new();
    for (position, kind, correct, points) in [
        (0, "objective", Some("A"), 3),
        (1, "objective", Some("B"), 2),
        (2, "subjective", None, 5),
    ] {
        let question_choices = if kind == "objective" { choices.clone() } else { json!([]) };
        let qid: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO questions (exam_id, kind, content, choices, correct_label, points, position)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(kind)
        .bind(json!({ "text": format!("Question {}", position + 1) }))
        .bind(question_choices)
        .bind(correct)
        .bind(points)
        .bind(position)
        .fetch_one(pool)
        .await
        .unwrap();
        ids.push(qid);
    }

    SeededExam {
        id,
        objective_a: ids[0],
        objective_b: ids[1],
        essay: ids[2],
    }
}

async fn open_exam(pool: &PgPool) -> SeededExam {
    let now = Utc::now();
    seed_exam(pool, now - chrono::Duration::minutes(5), now + chrono::Duration::hours(1), None).await
}

async fn fetch_content(client: &reqwest::Client, address: &str, exam_id: i64, token: &str) -> Value {
    let response = client
        .get(format!("{}/api/exams/{}/session", address, exam_id))
        .bearer_auth(token)
        .send()
        .await
        .expect("Failed to fetch content");
    assert_eq!(response.status().as_u16(), 200);
    response.json().await.unwrap()
}

async fn put_progress(
    client: &reqwest::Client,
    address: &str,
    session_id: i64,
    token: &str,
    answers: Value,
    finished: bool,
) -> reqwest::Response {
    client
        .put(format!("{}/api/sessions/{}/progress", address, session_id))
        .bearer_auth(token)
        .json(&json!({
            "answers": answers,
            "current_question": 0,
            "finished": finished,
            "saved_at": Utc::now(),
        }))
        .send()
        .await
        .expect("Failed to put progress")
}

async fn report(
    client: &reqwest::Client,
    address: &str,
    session_id: i64,
    token: &str,
    count: u32,
    lock: bool,
) -> reqwest::Response {
    client
        .post(format!("{}/api/sessions/{}/violations", address, session_id))
        .bearer_auth(token)
        .json(&json!({
            "reason": "fullscreen_exit",
            "violation_count": count,
            "lock": lock,
        }))
        .send()
        .await
        .expect("Failed to report violation")
}

#[tokio::test]
async fn test_submission_and_manual_grading_flow() {
    let Some((address, pool)) = spawn_app().await else {
        return;
    };
    let client = reqwest::Client::new();
    let exam = open_exam(&pool).await;
    let token = participant_token(1001);

    // 1. Open: answer keys are never sent.
    let content = fetch_content(&client, &address, exam.id, &token).await;
    let session_id = content["session"]["session_id"].as_i64().unwrap();
    assert_eq!(content["session"]["status"], "in_progress");
    assert_eq!(content["questions"].as_array().unwrap().len(), 3);
    assert!(content["questions"][0].get("correct_label").is_none());
    assert!(content["remaining_seconds"].as_i64().unwrap() > 0);

    // Reopening returns the same session.
    let again = fetch_content(&client, &address, exam.id, &token).await;
    assert_eq!(again["session"]["session_id"].as_i64().unwrap(), session_id);

    // 2. Autosave
    let answers = json!({
        exam.objective_a.to_string(): "A",
        exam.objective_b.to_string(): "B",
        exam.essay.to_string(): "Routing picks paths; forwarding moves packets.",
    });
    let resp = put_progress(&client, &address, session_id, &token, answers.clone(), false).await;
    assert_eq!(resp.status().as_u16(), 200);

    // 3. Submit: objective 3 + 2, subjective pending.
    let resp = put_progress(&client, &address, session_id, &token, answers.clone(), true).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["result"]["total"], 5);
    assert_eq!(body["result"]["pending_manual"], 1);

    // Repeated submission returns the stored record.
    let resp = put_progress(&client, &address, session_id, &token, json!({}), true).await;
    assert_eq!(resp.status().as_u16(), 200);
    let repeat: Value = resp.json().await.unwrap();
    assert_eq!(repeat["result"]["total"], 5);
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM question_scores WHERE session_id = $1")
        .bind(session_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 3);

    // Late autosave never reverts the completed status.
    let resp = put_progress(&client, &address, session_id, &token, answers, false).await;
    assert_eq!(resp.status().as_u16(), 409);

    // 4. Grading: participants cannot, objective items and out-of-range scores are refused.
    let grade_url = |qid: i64| format!("{}/api/admin/sessions/{}/scores/{}", address, session_id, qid);
    let resp = client
        .put(grade_url(exam.essay))
        .bearer_auth(&token)
        .json(&json!({ "score": 4 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    let resp = client
        .put(grade_url(exam.objective_a))
        .bearer_auth(admin_token())
        .json(&json!({ "score": 1 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .put(grade_url(exam.essay))
        .bearer_auth(admin_token())
        .json(&json!({ "score": 6 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = client
        .put(grade_url(exam.essay))
        .bearer_auth(admin_token())
        .json(&json!({ "score": 4 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let graded: Value = resp.json().await.unwrap();
    assert_eq!(graded["total"], 9);
    assert_eq!(graded["objective_score"], 5);
    assert_eq!(graded["pending_manual"], 0);

    // 5. Result reflects the grade.
    let result: Value = client
        .get(format!("{}/api/sessions/{}/result", address, session_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(result["total"], 9);

    // Another participant cannot read it.
    let resp = client
        .get(format!("{}/api/sessions/{}/result", address, session_id))
        .bearer_auth(participant_token(1002))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);
}

#[tokio::test]
async fn test_lock_blocks_writes_until_unlock() {
    let Some((address, pool)) = spawn_app().await else {
        return;
    };
    let client = reqwest::Client::new();
    let exam = open_exam(&pool).await;
    let token = participant_token(2001);

    let content = fetch_content(&client, &address, exam.id, &token).await;
    let session_id = content["session"]["session_id"].as_i64().unwrap();

    // Four recoverable violations, then the fifth locks.
    for count in 1..=4 {
        let resp = report(&client, &address, session_id, &token, count, false).await;
        assert_eq!(resp.status().as_u16(), 201);
        let ack: Value = resp.json().await.unwrap();
        assert_eq!(ack["is_locked"], false);
        assert_eq!(ack["seq"], count);
    }
    let ack: Value = report(&client, &address, session_id, &token, 5, true)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(ack["is_locked"], true);
    assert_eq!(ack["violation_count"], 5);

    let resp = put_progress(&client, &address, session_id, &token, json!({}), false).await;
    assert_eq!(resp.status().as_u16(), 403);

    // The unlock check still shows the lock.
    let content = fetch_content(&client, &address, exam.id, &token).await;
    assert_eq!(content["session"]["is_locked"], true);
    assert_eq!(content["session"]["lock_reason"], "fullscreen_exit");

    // Further reports keep the count frozen.
    let ack: Value = report(&client, &address, session_id, &token, 9, true)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(ack["violation_count"], 5);

    // Proctor views
    let sessions: Value = client
        .get(format!("{}/api/admin/exams/{}/sessions", address, exam.id))
        .bearer_auth(admin_token())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions[0]["id"].as_i64().unwrap(), session_id);
    assert_eq!(sessions[0]["is_locked"], true);

    let resp = client
        .post(format!("{}/api/admin/sessions/{}/unlock", address, session_id))
        .bearer_auth(admin_token())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let unlocked: Value = resp.json().await.unwrap();
    assert_eq!(unlocked["is_locked"], false);
    assert_eq!(unlocked["violation_count"], 0);

    let content = fetch_content(&client, &address, exam.id, &token).await;
    assert_eq!(content["session"]["is_locked"], false);

    let resp = put_progress(&client, &address, session_id, &token, json!({}), false).await;
    assert_eq!(resp.status().as_u16(), 200);

    // The log keeps the whole history.
    let records: Value = client
        .get(format!("{}/api/admin/sessions/{}/violations", address, session_id))
        .bearer_auth(admin_token())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let records = records.as_array().unwrap();
    assert_eq!(records.len(), 6);
    assert_eq!(records.iter().filter(|r| r["triggered_lock"] == true).count(), 1);
}

#[tokio::test]
async fn test_writes_after_end_time() {
    let Some((address, pool)) = spawn_app().await else {
        return;
    };
    let client = reqwest::Client::new();
    let now = Utc::now();
    let exam = seed_exam(&pool, now - chrono::Duration::hours(2), now - chrono::Duration::hours(1), None).await;
    let token = participant_token(3001);

    let content = fetch_content(&client, &address, exam.id, &token).await;
    let session_id = content["session"]["session_id"].as_i64().unwrap();
    assert_eq!(content["remaining_seconds"], 0);

    let answers = json!({ exam.objective_a.to_string(): "A" });
    let resp = put_progress(&client, &address, session_id, &token, answers.clone(), false).await;
    assert_eq!(resp.status().as_u16(), 409);

    // Submissions are still graded, just flagged.
    let resp = put_progress(&client, &address, session_id, &token, answers, true).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["late_submission"], true);
    assert_eq!(body["result"]["total"], 3);
    assert_eq!(body["result"]["unanswered_count"], 2);
}

#[tokio::test]
async fn test_exam_window_and_access_token() {
    let Some((address, pool)) = spawn_app().await else {
        return;
    };
    let client = reqwest::Client::new();
    let now = Utc::now();
    let token = participant_token(4001);

    let future = seed_exam(&pool, now + chrono::Duration::hours(1), now + chrono::Duration::hours(2), None).await;
    let resp = client
        .get(format!("{}/api/exams/{}/session", address, future.id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    let protected = seed_exam(
        &pool,
        now - chrono::Duration::minutes(1),
        now + chrono::Duration::hours(1),
        Some("opensesame"),
    )
    .await;
    let url = format!("{}/api/exams/{}/session", address, protected.id);
    let resp = client.get(&url).bearer_auth(&token).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 403);

    let resp = client
        .get(&url)
        .query(&[("token", "opensesame")])
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = client
        .get(format!("{}/api/exams/{}/session", address, i64::MAX))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}

#[tokio::test]
async fn test_runner_over_http() {
    let Some((address, pool)) = spawn_app().await else {
        return;
    };
    let exam = open_exam(&pool).await;
    let remote = HttpRemote::new(&address, participant_token(5001)).unwrap();
    let bridge = PersistenceBridge::new(remote, MemoryStash::new());

    let runner = SessionRunner::open(bridge, exam.id, None, EngineConfig::default())
        .await
        .expect("session opens");
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let handle = tokio::spawn(runner.run(rx));

    for (qid, value) in [
        (exam.objective_a, "A"),
        (exam.objective_b, "C"),
        (exam.essay, "Congestion control backs off on loss."),
    ] {
        tx.send(ClientEvent::Answer {
            question_id: qid,
            value: value.to_string(),
        })
        .await
        .unwrap();
    }
    tx.send(ClientEvent::Submit).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("runner finishes")
        .unwrap()
        .unwrap();
    let SessionOutcome::Completed(summary) = outcome else {
        panic!("expected completion");
    };
    assert_eq!(summary.total, 3);
    assert_eq!(summary.correct_count, 1);
    assert_eq!(summary.pending_manual, 1);
    drop(tx);
}
