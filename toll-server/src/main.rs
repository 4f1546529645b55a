use app::App;
use miette::Result;
use toll_server::app;

#[tokio::main]
async fn main() -> Result<()> {
    App::new().run().await
}
