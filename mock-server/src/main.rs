use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let addr = mock_server::listen_addr(std::env::var("PORT").ok().as_deref());
    let listener = TcpListener::bind(addr).await?;
    println!("transfer mock server on http://{}", listener.local_addr()?);
    mock_server::run(listener).await
}
