/// Atrium native login tool
/// Usage:
///   atrium-auth login    - run the browser sign-in flow
///   atrium-auth status   - show stored token state
///   atrium-auth logout   - revoke and clear stored tokens
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use atrium::auth::{
    AuthFlowManager, HttpOAuthProvider, KeyringTokenStore, SessionManager, TokenStore,
    DEFAULT_SUBJECT,
};
use atrium::config::Config;

const KEYRING_SERVICE: &str = "atrium";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let command = if args.len() >= 2 {
        args[1].as_str()
    } else {
        eprintln!("Usage: atrium-auth <login|status|logout>");
        std::process::exit(1);
    };

    let config = Config::load()?;
    let provider = Arc::new(HttpOAuthProvider::new(config.oauth.clone()));
    let store: Arc<dyn TokenStore> = Arc::new(KeyringTokenStore::new(KEYRING_SERVICE));

    match command {
        "login" => {
            println!("Starting browser sign-in...\n");

            let flow = AuthFlowManager::new(
                provider.clone(),
                Duration::from_secs(config.auth.auth_timeout),
            )
            .with_pkce(config.auth.pkce)
            .with_token_store(store.clone());

            // run_native blocks, so it gets its own thread
            let result = tokio::task::spawn_blocking(move || {
                flow.run_native(
                    Some(Box::new(|url: &str| {
                        println!("Open this URL in your browser:\n\n   {}\n", url);
                    })),
                    None,
                )
            })
            .await??;

            let user = result
                .user_info
                .as_ref()
                .map(|u| u.email.clone().unwrap_or_else(|| u.subject.clone()))
                .unwrap_or_default();
            println!("Signed in as {}", user);
            println!("Tokens stored in the system keyring");

            if let (Some(tokens), Some(info)) = (result.tokens, result.user_info) {
                // Also store under the default key so `status` finds them
                if info.subject != DEFAULT_SUBJECT {
                    store.store(DEFAULT_SUBJECT, &tokens)?;
                }
            }
        }

        "status" => {
            println!("Authentication status\n");

            match store.load(DEFAULT_SUBJECT)? {
                Some(tokens) => {
                    let state = if tokens.is_expired() { "expired" } else { "valid" };
                    println!("   Tokens: {}", state);
                    if let Some(expires_at) = tokens.expires_at() {
                        match chrono::DateTime::from_timestamp(expires_at, 0) {
                            Some(when) => println!("   Expires: {}", when),
                            None => println!("   Expires: (invalid timestamp)"),
                        }
                    } else {
                        println!("   Expires: never");
                    }
                    println!(
                        "   Refresh token: {}",
                        if tokens.refresh_token.is_some() { "yes" } else { "no" }
                    );
                }
                None => println!("   Not signed in"),
            }
        }

        "logout" => {
            let manager = Arc::new(SessionManager::new(
                provider,
                store,
                Duration::from_secs(config.auth.refresh_buffer),
            ));
            manager.initialize().await.ok();
            manager.logout().await;
            println!("Signed out; stored tokens cleared");
        }

        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Usage: atrium-auth <login|status|logout>");
            std::process::exit(1);
        }
    }

    Ok(())
}
