use swerve::config::Config;
use swerve::http::request::Method;
use swerve::http::router::HttpServer;

const GREETING: &str = "This is a test.";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let mut server = HttpServer::from_config(&cfg)?;

    server.add_handler(Method::Get, "/", false, |_request, mut response| {
        response.add_header("Content-Type", "text/plain");
        response.add_header("Content-Length", GREETING.len());
        response.add_header("Connection", "keep-alive");
        response.write_str(GREETING);
        response.finish();
    });

    server.start()?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    server.stop()
}
