use httptracer::app::run::main_with_error;

#[tokio::main]
async fn main() {
    if let Err(e) = main_with_error().await {
        eprintln!("httptracer: {:?}", e);
        std::process::exit(1);
    }
}
