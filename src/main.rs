use anyhow::Result;

mod dial;
mod fetch;
mod http;
#[cfg(test)]
mod test_server;
mod tls;

fn main() -> Result<()> {
    env_logger::init();

    let fetcher = fetch::Fetcher::new(fetch::Endpoint::default())?;
    fetcher.run(&mut std::io::stdout().lock())?;

    Ok(())
}
