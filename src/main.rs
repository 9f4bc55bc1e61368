use log::error;

#[tokio::main]
async fn main() {
    if let Err(err) = sma_bridge::app().await {
        error!("{:#}", err);
        std::process::exit(255);
    }
}
