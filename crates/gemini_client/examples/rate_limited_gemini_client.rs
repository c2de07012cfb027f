use std::env;
use std::str::FromStr;
use std::time::Duration;

use gemini_client::{GeminiClient, GeminiClientConfig, RequestPriority};
use rate_limiter_priority::priority_admission::PriorityAdmissionSettings;
use tracing::{error, info, warn};

// --- Configuration Environment Variable Names ---
const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";
const ENV_GEMINI_BASE_URL: &str = "GEMINI_API_BASE_URL"; // Optional, defaults are in lib.rs
const ENV_GEMINI_DEFAULT_MODEL: &str = "GEMINI_DEFAULT_MODEL"; // Optional
const ENV_USER_AGENT: &str = "GEMINI_CLIENT_USER_AGENT"; // Optional

// Priority admission settings
const ENV_PA_MAX_CONCURRENCY: &str = "PA_MAX_CONCURRENCY";
const ENV_PA_WINDOW_BUDGET: &str = "PA_WINDOW_BUDGET";
const ENV_PA_MAX_QUEUE_DEPTH: &str = "PA_MAX_QUEUE_DEPTH";

// Helper to parse environment variables with a default
fn get_env_var<T: FromStr + std::fmt::Debug>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    env::var(var_name)
        .ok()
        .and_then(|val_str| match val_str.parse::<T>() {
            Ok(val) => Some(val),
            Err(e) => {
                warn!(
                    "Failed to parse env var '{}' (value: '{}'). Error: {:?}. Using default: {:?}",
                    var_name, val_str, e, default_value
                );
                None
            }
        })
        .unwrap_or(default_value)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let default_log_filter = "info,gemini_client=info,rate_limiter_priority=debug";
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| default_log_filter.to_string()))
        .init();

    if dotenvy::dotenv().is_ok() {
        info!(".env file loaded successfully.");
    } else {
        info!(
            "No .env file found or failed to load. Proceeding with environment variables or defaults."
        );
    }

    let api_key = env::var(ENV_GEMINI_API_KEY).map_err(|_| {
        format!(
            "Required environment variable '{}' not set",
            ENV_GEMINI_API_KEY
        )
    })?;

    let default_config = GeminiClientConfig::default();

    let admission = PriorityAdmissionSettings::builder()
        .max_concurrency(get_env_var(
            ENV_PA_MAX_CONCURRENCY,
            default_config.admission.get_max_concurrency(),
        ))
        .window_budget(get_env_var(
            ENV_PA_WINDOW_BUDGET,
            default_config.admission.get_window_budget(),
        ))
        .max_queue_depth(get_env_var(
            ENV_PA_MAX_QUEUE_DEPTH,
            default_config.admission.get_max_queue_depth(),
        ))
        .build();

    info!(target: "config_loading", ?admission);

    let config = GeminiClientConfig {
        api_key,
        base_url: env::var(ENV_GEMINI_BASE_URL).unwrap_or(default_config.base_url),
        default_model: env::var(ENV_GEMINI_DEFAULT_MODEL).unwrap_or(default_config.default_model),
        user_agent: env::var(ENV_USER_AGENT).ok().or(default_config.user_agent),
        reqwest_client: None,
        admission,
        fallback_output_tokens: default_config.fallback_output_tokens,
    };

    info!(target: "config_final", client_config = ?config, "GeminiClient configuration loaded.");

    let client = GeminiClient::new(config)?;
    let default_model = client.config.default_model.clone();

    // --- Interactive call: a user is waiting on this one ---
    let user_prompt = "What is the color of the sky on a clear day? Answer concisely.".to_string();
    info!(
        "Sending interactive request with model '{}' for prompt: '{}'",
        default_model, user_prompt
    );
    match client
        .generate_text_from_user_prompt(&default_model, RequestPriority::Interactive, user_prompt)
        .await
    {
        Ok(text_response) => println!("Assistant (interactive): {}", text_response),
        Err(e) => error!("Error with interactive request: {}", e),
    }

    // --- Mixed-priority concurrent calls ---
    let num_concurrent_tasks = 10;
    info!("Spawning {} concurrent tasks...", num_concurrent_tasks);
    let mut tasks = vec![];
    for i in 0..num_concurrent_tasks {
        let client_clone = client.clone();
        let task_model = default_model.clone();
        // Every third task is a user-facing call; the rest queue behind it.
        let priority = if i % 3 == 0 {
            RequestPriority::Interactive
        } else {
            RequestPriority::Background
        };
        tasks.push(tokio::spawn(async move {
            let prompt = format!(
                "Briefly explain concept #{} for a five-year-old in one sentence.",
                i
            );
            match client_clone
                .generate_text_from_user_prompt(&task_model, priority, prompt)
                .await
            {
                Ok(res_text) => println!(
                    "[Task {} {:?}] SUCCESS: {:.100}...",
                    i,
                    priority,
                    res_text.replace('\n', " ")
                ),
                Err(e) => error!("[Task {} {:?}] ERROR: {}", i, priority, e),
            }
        }));
        if i < 5 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }
    for (i, task) in tasks.into_iter().enumerate() {
        match task.await {
            Ok(_) => info!("[Main] Task {} finished.", i),
            Err(e) => error!("[Main] Task {} join error: {}", i, e),
        }
    }

    // --- Status short-circuit: skip an optional refresh during a cooldown ---
    let status = client.rate_limit_status();
    if status.is_backing_off {
        info!(
            queue_depth = status.queue_depth,
            "Upstream is cooling down; serving the cached summary instead of refreshing."
        );
    } else {
        match client
            .generate_text_from_user_prompt(
                &default_model,
                RequestPriority::Background,
                "Summarize the benefits of rate limiting in one sentence.".to_string(),
            )
            .await
        {
            Ok(summary) => println!("Background refresh: {}", summary),
            Err(e) => error!("Background refresh failed: {}", e),
        }
    }

    info!("All example calls completed.");
    Ok(())
}
