use std::path::PathBuf;

#[tokio::main]
async fn main() {
    chaser::debug::init_tracing();

    let data_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"));

    if let Err(e) = chaser::run(&data_dir).await {
        tracing::error!(error = %e, "engine failed");
        std::process::exit(1);
    }
}
