pub mod config;
pub mod observer;
pub mod server;
pub mod statistics;
pub mod tap;

use std::sync::Arc;

use anyhow::Result;
use codec::crypto::SigningIdentity;
use service::peer::IdentityStore;

use self::{config::Config, statistics::Statistics, tap::VirtualInterface};

/// Build the node's identity material from the configuration.
///
/// A node without any configured identity refuses to start: silently
/// minting a throwaway certificate would let it impersonate nothing and be
/// impersonated by anything. `allow-generated-identity` opts into exactly
/// that, loudly.
pub fn load_identity(security: &config::Security) -> Result<IdentityStore> {
    let certificate = match (&security.certificate_file, &security.private_key_file) {
        (Some(certificate), Some(private_key)) => Some(
            SigningIdentity::from_parts(
                std::fs::read(certificate)?,
                &std::fs::read(private_key)?,
            )
            .map_err(|error| anyhow::anyhow!("cannot load identity: {}", error))?,
        ),
        (None, None) => None,
        _ => anyhow::bail!("certificate-file and private-key-file must be set together"),
    };

    let pre_shared_key = security
        .pre_shared_key
        .as_ref()
        .map(|psk| psk.as_bytes().to_vec());

    if certificate.is_none() && pre_shared_key.is_none() {
        if !security.allow_generated_identity {
            anyhow::bail!(
                "no certificate and no pre-shared key configured; set \
                 allow-generated-identity to run with a throwaway identity"
            );
        }

        log::warn!(
            "RUNNING WITH A GENERATED THROWAWAY IDENTITY: peers cannot recognize this node \
             across restarts and anyone can impersonate it"
        );

        return Ok(IdentityStore {
            certificate: Some(
                SigningIdentity::generate_ephemeral()
                    .map_err(|error| anyhow::anyhow!("cannot generate identity: {}", error))?,
            ),
            pre_shared_key: None,
        });
    }

    Ok(IdentityStore {
        certificate,
        pre_shared_key,
    })
}

/// Start the node: identical to what `main` does, opened up so the
/// integration tests can run full nodes in-process with their own virtual
/// interfaces.
pub async fn startup(
    config: Arc<Config>,
    interface: Option<Box<dyn VirtualInterface>>,
) -> Result<server::NodeHandle> {
    server::run(config, Statistics::default(), interface).await
}
