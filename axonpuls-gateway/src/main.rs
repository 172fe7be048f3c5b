use axonpuls_gateway::{Application, NodeConfig};
use axonpuls_helpers::env::{EnvVars, ProcessEnvVars};

#[tokio::main]
async fn main() {
    let env = ProcessEnvVars::new();
    let log_format = env.var("AXONPULS_LOG_FORMAT").unwrap_or_default();
    axonpuls_gateway::telemetry::setup_tracing(&log_format);

    let config = NodeConfig::from_env(&env);
    let app = Application::new(config);

    if let Err(e) = app.run().await {
        tracing::error!(error = %e, "gateway exited with error");
        std::process::exit(1);
    }
}
