use gantry::host::{ServerOptions, Site, CATCH_ALL_KEY};
use gantry::Server;
use log::error;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let basedir = std::env::args().nth(1).unwrap_or_else(|| "hooks".to_owned());
    let site = Site::new(vec!["localhost".into()], 'A', "Development site")
        .expect("static site definition");

    let mut options = ServerOptions::new(basedir)
        .add_site("localhost", site.clone())
        .add_site(CATCH_ALL_KEY, site)
        .safe_hooks(true);
    options.ports = vec![8080];
    options.recursive_watch = true;

    let server = match Server::new(options) {
        Ok(server) => server,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = server.run().await {
        error!("server failed: {err}");
        std::process::exit(1);
    }
}
