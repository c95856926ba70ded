//! DATA-phase receiver.
//!
//! After the 354 go-ahead the receiver owns the stream until the
//! `<CRLF>.<CRLF>` sentinel. Lines are dot-unstuffed by the connection
//! and streamed to the message handler one at a time; the engine holds
//! no copy of the body. A handler rejection mid-stream switches the
//! receiver into drain mode: the rest of the payload is consumed off
//! the wire so the client's dot still gets an orderly reply.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    address::Mailbox,
    connection::{Connection, DataLine},
    error::{ConnectionError, SessionError},
    handler::{MessageHandler, Rejection, SessionInfo},
    internal,
    reply::Reply,
};

pub(crate) struct DataReceiver<'a> {
    pub host_name: &'a str,
    pub software_name: &'a str,
    pub insert_received_header: bool,
    pub timeout: Duration,
    pub info: &'a SessionInfo,
    pub first_recipient: &'a Mailbox,
}

impl DataReceiver<'_> {
    /// Run the DATA phase to completion and produce the reply for the
    /// sentinel. The handler's `done`/`aborted` contract is honored on
    /// every path; errors returned here mean the connection itself is
    /// gone (or timed out) and the handler has already been aborted.
    pub async fn receive<Stream>(
        &self,
        connection: &mut Connection<Stream>,
        handler: &mut dyn MessageHandler,
    ) -> Result<Reply, SessionError>
    where
        Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync,
    {
        let mut rejection: Option<Rejection> = None;

        if self.insert_received_header {
            let header = self.received_header();
            if let Err(refused) = handler.data(header.as_bytes()).await {
                rejection = Some(refused);
            }
        }

        loop {
            let line = match tokio::time::timeout(self.timeout, connection.read_data_line()).await
            {
                Err(_) => {
                    handler.aborted().await;
                    return Err(ConnectionError::Timeout.into());
                }
                Ok(Err(ConnectionError::LineTooLong(_))) => {
                    // Stay in sync; the payload is refused at the dot
                    rejection
                        .get_or_insert_with(|| Rejection::with_reply(Reply::line_too_long()));
                    continue;
                }
                Ok(Err(err)) => {
                    internal!("Connection lost during DATA: {err}");
                    handler.aborted().await;
                    return Err(err.into());
                }
                Ok(Ok(line)) => line,
            };

            match line {
                DataLine::EndOfMessage => break,
                DataLine::Line(mut line) => {
                    if rejection.is_none() {
                        line.extend_from_slice(b"\r\n");
                        if let Err(refused) = handler.data(&line).await {
                            rejection = Some(refused);
                        }
                    }
                }
            }
        }

        if let Some(rejection) = rejection {
            handler.aborted().await;
            return Ok(rejection.into_reply(Reply::transaction_failed()));
        }

        Ok(match handler.done().await {
            Ok(()) => Reply::message_accepted(),
            Err(rejection) => rejection.into_reply(Reply::transaction_failed()),
        })
    }

    /// Trace header per RFC 5321 Section 4.4, protocol token per
    /// RFC 3848 (ESMTP, +S under TLS, +A when authenticated).
    fn received_header(&self) -> String {
        let helo = self.info.helo_host.as_deref().unwrap_or("unknown");
        let remote_host = self.info.remote_host.as_deref().unwrap_or("unknown");
        let remote_ip = self.info.peer.ip();

        let mut protocol = String::from("ESMTP");
        if self.info.tls_active {
            protocol.push('S');
        }
        if self.info.authenticated.is_some() {
            protocol.push('A');
        }

        format!(
            "Received: from {helo} ({remote_host} [{remote_ip}])\r\n        by {} ({}) with {protocol} id {}\r\n        for <{}>; {}\r\n",
            self.host_name,
            self.software_name,
            self.info.id,
            self.first_recipient,
            chrono::Utc::now().to_rfc2822(),
        )
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::address::parse_forward_path;

    #[derive(Default)]
    struct Sink {
        received: Vec<u8>,
        done: bool,
        aborted: bool,
        refuse_data: bool,
    }

    #[async_trait]
    impl MessageHandler for Sink {
        async fn data(&mut self, chunk: &[u8]) -> Result<(), Rejection> {
            if self.refuse_data {
                return Err(Rejection::denied());
            }
            self.received.extend_from_slice(chunk);
            Ok(())
        }

        async fn done(&mut self) -> Result<(), Rejection> {
            self.done = true;
            Ok(())
        }

        async fn aborted(&mut self) {
            self.aborted = true;
        }
    }

    fn info() -> SessionInfo {
        SessionInfo {
            id: "abc123".to_string(),
            peer: "192.0.2.7:2525".parse().unwrap(),
            remote_host: None,
            helo_host: Some("client.test".to_string()),
            extended: true,
            tls_active: false,
            authenticated: None,
        }
    }

    fn receiver<'a>(
        info: &'a SessionInfo,
        recipient: &'a Mailbox,
        insert_received_header: bool,
    ) -> DataReceiver<'a> {
        DataReceiver {
            host_name: "mx.test",
            software_name: "X 1.0",
            insert_received_header,
            timeout: Duration::from_secs(5),
            info,
            first_recipient: recipient,
        }
    }

    #[tokio::test]
    async fn delivers_unstuffed_body() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client
            .write_all(b"Subject: hi\r\n\r\nhello\r\n.\r\n")
            .await
            .unwrap();

        let info = info();
        let recipient = parse_forward_path("<b@y.test>").unwrap();
        let mut sink = Sink::default();
        let reply = receiver(&info, &recipient, false)
            .receive(&mut connection, &mut sink)
            .await
            .unwrap();

        assert_eq!(reply.code(), 250);
        assert!(sink.done);
        assert!(!sink.aborted);
        assert_eq!(sink.received, b"Subject: hi\r\n\r\nhello\r\n");
    }

    #[tokio::test]
    async fn dot_stuffing_round_trip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client.write_all(b"..hello\r\n.\r\n").await.unwrap();

        let info = info();
        let recipient = parse_forward_path("<b@y.test>").unwrap();
        let mut sink = Sink::default();
        receiver(&info, &recipient, false)
            .receive(&mut connection, &mut sink)
            .await
            .unwrap();

        assert_eq!(sink.received, b".hello\r\n");
    }

    #[tokio::test]
    async fn injects_received_header() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client.write_all(b"body\r\n.\r\n").await.unwrap();

        let info = info();
        let recipient = parse_forward_path("<b@y.test>").unwrap();
        let mut sink = Sink::default();
        receiver(&info, &recipient, true)
            .receive(&mut connection, &mut sink)
            .await
            .unwrap();

        let text = String::from_utf8(sink.received).unwrap();
        assert!(text.starts_with("Received: from client.test (unknown [192.0.2.7])\r\n"));
        assert!(text.contains("by mx.test (X 1.0) with ESMTP id abc123"));
        assert!(text.contains("for <b@y.test>; "));
        assert!(text.ends_with("body\r\n"));
    }

    #[tokio::test]
    async fn handler_rejection_drains_payload() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client
            .write_all(b"line one\r\nline two\r\n.\r\nNOOP\r\n")
            .await
            .unwrap();

        let info = info();
        let recipient = parse_forward_path("<b@y.test>").unwrap();
        let mut sink = Sink {
            refuse_data: true,
            ..Sink::default()
        };
        let reply = receiver(&info, &recipient, false)
            .receive(&mut connection, &mut sink)
            .await
            .unwrap();

        assert_eq!(reply.code(), 554);
        assert!(sink.aborted);
        assert!(!sink.done);
        // The payload was fully drained; the next command is intact
        assert_eq!(connection.read_line().await.unwrap(), b"NOOP");
    }

    #[tokio::test]
    async fn connection_loss_aborts_handler() {
        let (client, server) = tokio::io::duplex(4096);
        let mut connection = Connection::new(server, 998);

        let mut client = client;
        client.write_all(b"partial line\r\n").await.unwrap();
        drop(client);

        let info = info();
        let recipient = parse_forward_path("<b@y.test>").unwrap();
        let mut sink = Sink::default();
        let result = receiver(&info, &recipient, false)
            .receive(&mut connection, &mut sink)
            .await;

        assert!(result.is_err());
        assert!(sink.aborted);
        assert!(!sink.done);
    }

    #[test]
    fn protocol_token_variants() {
        let recipient = parse_forward_path("<b@y.test>").unwrap();

        let mut info = info();
        info.tls_active = true;
        info.authenticated = Some("a".to_string());
        let header = receiver(&info, &recipient, true).received_header();
        assert!(header.contains("with ESMTPSA id"));

        info.authenticated = None;
        let header = receiver(&info, &recipient, true).received_header();
        assert!(header.contains("with ESMTPS id"));
    }
}
