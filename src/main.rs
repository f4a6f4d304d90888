mod credentials;
mod model;
mod photos_client;

use std::path::PathBuf;

use clap::Parser;
use git_version::git_version;

use crate::credentials::{CredentialStore, InstalledAppFlow};
use crate::photos_client::{DISCOVERY_URL, PhotosClient};

pub const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Google Photos Downloader
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Client secrets file exported from the Google Cloud console
    #[clap(short, long, default_value = "credentials.json")]
    credentials_file: PathBuf,

    /// Where the authorized token is kept between runs
    #[clap(short, long, default_value = "token.json")]
    token_file: PathBuf,

    /// Directory the dated photo tree is written under
    #[clap(short, long, default_value = "photos")]
    output_directory: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    println!("Google Photos Downloader");
    println!("Version {GIT_VERSION}");

    let store = CredentialStore::new(&args.credentials_file, &args.token_file);
    let credential = store.obtain(&InstalledAppFlow::new()).await?;

    let client = PhotosClient::connect(DISCOVERY_URL, &credential).await?;

    println!("Downloading library. This may take several minutes...");
    client.download_all(&args.output_directory).await;

    Ok(())
}
