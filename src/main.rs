#[tokio::main]
async fn main() {
    if let Err(e) = deskpilot_lib::run().await {
        eprintln!("deskpilot: {e}");
        std::process::exit(1);
    }
}
