use goose::prelude::*;
use std::env;

fn credentials() -> (String, String) {
    (
        env::var("LOADTEST_USERNAME").unwrap_or_else(|_| "alice".to_string()),
        env::var("LOADTEST_PASSWORD").unwrap_or_default(),
    )
}

fn scope() -> String {
    env::var("LOADTEST_SCOPE").unwrap_or_else(|_| "repository:library/alpine:pull".to_string())
}

async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose_metrics = user.get("/healthz").await?;
    Ok(())
}

async fn get_anonymous_token(user: &mut GooseUser) -> TransactionResult {
    let path = format!("/token?service=registry&scope={}", scope());
    let _goose_metrics = user.get(&path).await?;
    Ok(())
}

async fn get_docker_token(user: &mut GooseUser) -> TransactionResult {
    let (username, password) = credentials();
    let path = format!("/token?service=registry&scope={}", scope());

    let request_builder = user
        .get_request_builder(&GooseMethod::Get, &path)?
        .basic_auth(username, Some(password));
    let goose_request = GooseRequest::builder()
        .set_request_builder(request_builder)
        .build();

    let _goose_metrics = user.request(goose_request).await?;
    Ok(())
}

async fn password_then_refresh(user: &mut GooseUser) -> TransactionResult {
    let (username, password) = credentials();
    let scope = scope();

    let goose = user
        .post_form(
            "/token",
            &[
                ("grant_type", "password"),
                ("username", username.as_str()),
                ("password", password.as_str()),
                ("scope", scope.as_str()),
            ],
        )
        .await?;

    let refresh_token = match goose.response {
        Ok(response) => response
            .text()
            .await
            .ok()
            .and_then(|body| serde_json::from_str::<serde_json::Value>(&body).ok())
            .and_then(|body| body["refresh_token"].as_str().map(str::to_string)),
        Err(_) => None,
    };

    if let Some(refresh_token) = refresh_token {
        let _goose_metrics = user
            .post_form(
                "/token",
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token.as_str()),
                    ("scope", scope.as_str()),
                ],
            )
            .await?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    if env::var("LOADTEST_PASSWORD").is_err() {
        println!("No LOADTEST_PASSWORD set, authenticated scenarios will be rejected with 401");
    }

    println!("Requested scope: {}", scope());

    GooseAttack::initialize()?
        .register_scenario(
            scenario!("HealthCheck").register_transaction(transaction!(health_check)),
        )
        .register_scenario(
            scenario!("DockerTokenFlow")
                .register_transaction(transaction!(get_anonymous_token))
                .register_transaction(transaction!(get_docker_token)),
        )
        .register_scenario(
            scenario!("OAuth2TokenFlow").register_transaction(transaction!(password_then_refresh)),
        )
        .execute()
        .await?;

    Ok(())
}
