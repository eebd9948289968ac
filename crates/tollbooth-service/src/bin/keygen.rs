//! Generate an authority signing key.

use clap::Parser;
use tollbooth_core::{AuthorityKeys, SignatureScheme};

#[derive(Debug, Parser)]
#[command(name = "tollbooth-keygen", version, about = "Generate a Tollbooth authority signing key")]
struct Cli {
    /// eddsa-jwt or schnorr-nostr
    #[arg(long, default_value = "schnorr-nostr")]
    scheme: SignatureScheme,

    /// Print a JSON object instead of shell assignments
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (keys, secret_hex) = AuthorityKeys::generate(cli.scheme)?;

    if cli.json {
        let document = serde_json::json!({
            "scheme": cli.scheme,
            "secret_key_hex": secret_hex,
            "public_key_hex": keys.public_key_hex(),
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
    } else {
        println!("TOLLBOOTH_SIGNING__SCHEME={}", cli.scheme);
        println!("TOLLBOOTH_SIGNING__SECRET_KEY_HEX={secret_hex}");
        println!("# public key: {}", keys.public_key_hex());
    }
    Ok(())
}
