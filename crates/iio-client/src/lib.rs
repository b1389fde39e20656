#![warn(missing_docs)]

//! IIOD client: opens contexts from URIs and drives remote devices over
//! the IIOD protocol.
//!
//! ```no_run
//! # async fn demo() -> iio_model::Result<()> {
//! use iio_client::{create_context, ClientConfig, IioContext};
//!
//! let ctx = create_context("ip:192.168.2.1", &ClientConfig::default()).await?;
//! if let IioContext::Remote(client) = ctx {
//!     let attr = client.find_attr(iio_model::AttrOwner::Device(0), "sampling_frequency")?;
//!     println!("{}", client.read_longlong(attr).await?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod evstream;
pub mod stream;
pub mod uri;

pub use buffer::{Block, Buffer};
pub use client::Client;
pub use config::ClientConfig;
pub use evstream::EventStream;
pub use stream::Stream;
pub use uri::Uri;

use iio_model::{xml, Context, Error, Result};
use tracing::debug;

/// A context opened from a URI.
#[derive(Debug)]
pub enum IioContext {
    /// Parsed from an XML description; attributes carry no live values.
    Offline(Context),
    /// Served by an IIOD daemon.
    Remote(Client),
}

impl IioContext {
    /// The context description.
    pub fn context(&self) -> &Context {
        match self {
            IioContext::Offline(ctx) => ctx,
            IioContext::Remote(client) => client.context(),
        }
    }
}

/// Opens the context named by `uri`.
///
/// `xml:` takes either an inline document (starting with `<`) or a file
/// path. `ip:` needs a host; discovering one is not supported. Local, USB
/// and serial contexts have no transport here and fail with
/// [`Error::NotImplemented`].
pub async fn create_context(uri: &str, config: &ClientConfig) -> Result<IioContext> {
    let parsed: Uri = uri.parse()?;
    debug!(%parsed, "opening context");
    match parsed {
        Uri::Xml(source) => {
            let text = if source.trim_start().starts_with('<') {
                source
            } else {
                tokio::fs::read_to_string(&source).await?
            };
            Ok(IioContext::Offline(xml::parse(&text)?))
        }
        Uri::Ip {
            host: Some(host),
            port,
        } => Ok(IioContext::Remote(
            Client::connect(&host, port, config.clone()).await?,
        )),
        Uri::Ip { host: None, .. } | Uri::Local | Uri::Usb { .. } | Uri::Serial(_) => {
            Err(Error::NotImplemented)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use iiod::demo::demo_backend;
    use iiod::{Daemon, Server};
    use iio_transport::CancelToken;

    #[tokio::test]
    async fn test_offline_xml_context() {
        let ctx = iiod::demo::demo_context().unwrap();
        let text = xml::to_xml(&ctx);
        let opened = create_context(&format!("xml:{text}"), &ClientConfig::default())
            .await
            .unwrap();
        assert!(matches!(opened, IioContext::Offline(_)));
        assert_eq!(opened.context().devices().len(), ctx.devices().len());

        let mut file = tempfile::NamedTempFile::with_suffix(".xml").unwrap();
        std::io::Write::write_all(&mut file, text.as_bytes()).unwrap();
        let uri = format!("xml:{}", file.path().display());
        let opened = create_context(&uri, &ClientConfig::default()).await.unwrap();
        assert_eq!(opened.context().devices().len(), ctx.devices().len());
    }

    #[tokio::test]
    async fn test_unsupported_uris() {
        let config = ClientConfig::default();
        for uri in ["local:", "ip:", "usb:1.2", "serial:/dev/ttyUSB0"] {
            assert_eq!(create_context(uri, &config).await.unwrap_err(), Error::NotImplemented);
        }
        assert_eq!(create_context("bogus", &config).await.unwrap_err(), Error::InvalidArgument);
    }

    #[tokio::test]
    async fn test_remote_context_over_tcp() {
        let daemon = Arc::new(Daemon::new(Arc::new(demo_backend().unwrap()), Some(3), 1000).unwrap());
        let server = Server::new(daemon, 0);
        let listener = server.bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shutdown = CancelToken::new();
        let stop = shutdown.clone();
        let task = tokio::spawn(async move { server.run(listener, stop).await });

        let opened = create_context(&format!("ip:127.0.0.1:{port}"), &ClientConfig::default())
            .await
            .unwrap();
        let IioContext::Remote(client) = opened else {
            panic!("expected a remote context");
        };
        assert_eq!(client.context().devices().len(), 3);

        client.shutdown().await;
        shutdown.cancel();
        task.await.unwrap();
    }
}
