// Client creation with custom user-agent support for kube 2.x
use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};

/// Create a new k8s client to interact with the cluster api.
///
/// A custom user-agent helps pick out this cache's list/watch traffic in
/// apiserver audit logs; an invalid header value falls back to the default
/// agent rather than failing client construction.
///
/// # Errors
///
/// Will return `Err` if the kubeconfig cannot be inferred or the client
/// cannot be built from it
pub async fn new(custom_user_agent: Option<&str>) -> Result<Client> {
    let mut config = Config::infer().await?;

    if let Some(user_agent) = custom_user_agent {
        if let Ok(header_value) = HeaderValue::from_str(user_agent) {
            config
                .headers
                .push((HeaderName::from_static("user-agent"), header_value));
        }
    }

    let client = Client::try_from(config)?;

    Ok(client)
}
