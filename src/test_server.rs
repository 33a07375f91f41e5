//! Loopback TLS origin with a self-signed certificate. Each canned response
//! is served on its own connection and the server reports what it saw.

use std::{
    io::{Read, Write},
    net::TcpListener,
    sync::Arc,
    thread::{self, JoinHandle},
};

use rustls::{
    ServerConfig, ServerConnection, StreamOwned,
    crypto::aws_lc_rs,
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
};

#[derive(Debug, Default)]
pub struct Exchange {
    pub server_name: Option<String>,
    pub request_head: String,
}

pub struct TestServer {
    pub port: u16,
    handle: JoinHandle<Vec<Exchange>>,
}

impl TestServer {
    pub fn spawn<R>(cert_name: &str, responses: Vec<R>) -> Self
    where
        R: AsRef<[u8]> + Send + 'static,
    {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![cert_name.to_string()]).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let config = ServerConfig::builder_with_provider(Arc::new(aws_lc_rs::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert.der().clone()], key)
            .unwrap();
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            responses
                .into_iter()
                .map(|response| serve(&listener, config.clone(), response.as_ref()))
                .collect::<Vec<_>>()
        });

        Self { port, handle }
    }

    /// Waits until every response has been served.
    pub fn finish(self) -> Vec<Exchange> {
        self.handle.join().unwrap()
    }
}

fn serve(listener: &TcpListener, config: Arc<ServerConfig>, response: &[u8]) -> Exchange {
    let (sock, _) = listener.accept().unwrap();
    let mut tls = StreamOwned::new(ServerConnection::new(config).unwrap(), sock);

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match tls.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => break,
        }
    }

    if head.ends_with(b"\r\n\r\n") {
        let _ = tls.write_all(response);
        tls.conn.send_close_notify();
        let _ = tls.flush();
    }

    Exchange {
        server_name: tls.conn.server_name().map(str::to_string),
        request_head: String::from_utf8_lossy(&head).into_owned(),
    }
}
