use std::fs;

use mailparse::{parse_mail, MailHeaderMap};
use mailpost_utils::{
    build, deliver, tls_server_config, BodyType, CaptureOptions, CaptureServer, Credentials,
    Envelope, FailureKind, MailStore, MemoryAuthEngine, Message, Outgoing, SmtpSession,
    TlsOptions, TransportConfig, TransportError,
};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    ServerConfig,
};
use tempfile::TempDir;

async fn start(options: CaptureOptions) -> (TransportConfig, MailStore) {
    let server = CaptureServer::bind("127.0.0.1:0", options).await.unwrap();
    let addr = server.local_addr().unwrap();
    let store = server.store();
    server.spawn();
    (TransportConfig::new("127.0.0.1", addr.port()), store)
}

fn self_signed() -> (ServerConfig, CertificateDer<'static>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = CertificateDer::from(cert.serialize_der().unwrap());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
    let config = tls_server_config(vec![cert_der.clone()], key_der).unwrap();
    (config, cert_der)
}

fn insecure_tls() -> TlsOptions {
    TlsOptions {
        accept_invalid_certs: true,
        ..Default::default()
    }
}

fn outgoing(from: &str, to: &str, subject: &str, body: &str) -> Outgoing {
    let message = Message::builder()
        .from(from)
        .to(to)
        .subject(subject)
        .body(body)
        .build()
        .unwrap();
    Outgoing::from(&message)
}

#[tokio::test]
async fn test_deliver_plain_message() {
    let (config, store) = start(CaptureOptions::default()).await;

    let wire = build::<&str>("a@x.com", "b@x.com", "Hi", "hello", BodyType::Plain, &[]).unwrap();
    let batch = [Outgoing::new(Envelope::new("a@x.com", ["b@x.com"]), wire)];
    let receipts = deliver(&config, &batch).await.unwrap();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].reply.code, 250);
    assert!(receipts[0].refused.is_empty());

    let mails = store.mails().await;
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].envelope_from, "a@x.com");
    assert_eq!(mails[0].envelope_to, vec!["b@x.com"]);

    let parsed = parse_mail(&mails[0].data).unwrap();
    assert_eq!(parsed.headers.get_first_value("Subject").unwrap(), "Hi");
    assert_eq!(parsed.subparts[0].get_body().unwrap().trim_end(), "hello");

    let sessions = store.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(
        sessions[0].verbs(),
        vec!["EHLO", "MAIL", "RCPT", "DATA", "QUIT"]
    );
}

#[tokio::test]
async fn test_starttls_handshakes_twice_before_sending() {
    let (server_config, _) = self_signed();
    let (config, store) = start(CaptureOptions::default().tls(server_config)).await;
    let config = config.starttls().tls(insecure_tls());

    let mut session = SmtpSession::open(config).await.unwrap();
    assert!(session.is_secure());
    assert_eq!(session.handshakes(), 2);
    assert!(!session.capabilities().supports("STARTTLS"));

    let batch = [outgoing("a@x.com", "b@x.com", "Secure", "over tls")];
    session.send_all(&batch).await.unwrap();
    assert!(session.close().await);

    let sessions = store.sessions().await;
    let log = &sessions[0];
    assert_eq!(
        log.verbs(),
        vec!["EHLO", "STARTTLS", "EHLO", "MAIL", "RCPT", "DATA", "QUIT"]
    );
    assert!(!log.commands[0].secure);
    assert!(log.commands[2].secure);
    assert!(log.commands[3..].iter().all(|command| command.secure));

    let mails = store.mails().await;
    assert!(mails[0].secure);
}

#[tokio::test]
async fn test_starttls_with_trusted_root() {
    let (server_config, cert_der) = self_signed();
    let (config, store) = start(CaptureOptions::default().tls(server_config)).await;
    let config = config.starttls().tls(TlsOptions {
        root_certs: vec![cert_der],
        server_name: Some("localhost".to_string()),
        ..Default::default()
    });

    let batch = [outgoing("a@x.com", "b@x.com", "Verified", "trusted")];
    deliver(&config, &batch).await.unwrap();
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_starttls_untrusted_certificate() {
    let (server_config, _) = self_signed();
    let (config, store) = start(CaptureOptions::default().tls(server_config)).await;

    let error = deliver(&config.starttls(), &[]).await.unwrap_err();
    assert!(matches!(error, TransportError::Tls(_)));
    assert_eq!(error.kind(), FailureKind::Handshake);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_login_after_starttls() {
    let (server_config, _) = self_signed();
    let options = CaptureOptions::default()
        .tls(server_config)
        .auth(MemoryAuthEngine::with_user("user", "secret"))
        .auth_required(true);
    let (config, store) = start(options).await;
    let config = config
        .starttls()
        .tls(insecure_tls())
        .credentials(Credentials::new("user", "secret"));

    let batch = [outgoing("a@x.com", "b@x.com", "Login", "authenticated")];
    deliver(&config, &batch).await.unwrap();

    let mails = store.mails().await;
    assert_eq!(mails[0].authenticated_as.as_deref(), Some("user"));
    let sessions = store.sessions().await;
    assert_eq!(
        sessions[0].verbs(),
        vec!["EHLO", "STARTTLS", "EHLO", "AUTH", "MAIL", "RCPT", "DATA", "QUIT"]
    );
}

#[tokio::test]
async fn test_rejected_login_closes_once() {
    let options = CaptureOptions::default().auth(MemoryAuthEngine::with_user("user", "secret"));
    let (config, store) = start(options).await;
    let config = config.credentials(Credentials::new("user", "wrong"));

    let batch = [outgoing("a@x.com", "b@x.com", "Nope", "never sent")];
    let error = deliver(&config, &batch).await.unwrap_err();
    assert!(matches!(error, TransportError::Auth(ref reply) if reply.code == 535));
    assert_eq!(error.kind(), FailureKind::Authentication);

    assert!(store.is_empty().await);
    let sessions = store.sessions().await;
    assert_eq!(sessions[0].verbs(), vec!["EHLO", "AUTH", "QUIT"]);
}

#[tokio::test]
async fn test_all_recipients_refused() {
    let (config, store) = start(CaptureOptions::default().reject("b@x.com")).await;

    let batch = [outgoing("a@x.com", "b@x.com", "Refused", "nobody home")];
    let error = deliver(&config, &batch).await.unwrap_err();
    match &error {
        TransportError::RecipientsRefused(refused) => {
            assert_eq!(refused.len(), 1);
            assert_eq!(refused[0].recipient, "b@x.com");
            assert_eq!(refused[0].reply.code, 550);
        }
        _ => panic!("Expected refused recipients, got {error:?}"),
    }
    assert_eq!(error.kind(), FailureKind::Delivery);

    let sessions = store.sessions().await;
    assert_eq!(sessions[0].verbs(), vec!["EHLO", "MAIL", "RCPT", "RSET", "QUIT"]);
    assert_eq!(sessions[0].count("QUIT"), 1);
}

#[tokio::test]
async fn test_partially_refused_recipients() {
    let (config, store) = start(CaptureOptions::default().reject("c@x.com")).await;

    let message = Message::builder()
        .from("a@x.com")
        .recipients(["b@x.com", "c@x.com"])
        .subject("Partial")
        .body("some of you")
        .build()
        .unwrap();
    let receipts = deliver(&config, &[Outgoing::from(&message)]).await.unwrap();
    assert_eq!(receipts[0].refused.len(), 1);
    assert_eq!(receipts[0].refused[0].recipient, "c@x.com");

    let mails = store.mails().await;
    assert_eq!(mails[0].envelope_to, vec!["b@x.com"]);
}

#[tokio::test]
async fn test_batch_in_single_session() {
    let (config, store) = start(CaptureOptions::default()).await;

    let batch = [
        outgoing(
            "sender@example.com",
            "recipient@example.com",
            "ローカルSMTPサーバーからのテストメール",
            "これはローカルSMTPサーバーから送信したテストメールです。BODY",
        ),
        outgoing(
            "test@example.com",
            "saitama.sf@example.com",
            "明日の会議について",
            "明日の会議はなしで",
        ),
        outgoing(
            "ibariaki@example.com",
            "iba.sf@example.com",
            "欠席連絡",
            "明後日から欠席します",
        ),
    ];
    let receipts = deliver(&config, &batch).await.unwrap();
    assert_eq!(receipts.len(), 3);

    let mails = store.mails().await;
    assert_eq!(mails.len(), 3);
    for (mail, outgoing) in mails.iter().zip(&batch) {
        assert_eq!(mail.envelope_from, outgoing.envelope.from);
        assert_eq!(mail.envelope_to, outgoing.envelope.to);
    }

    let parsed = parse_mail(&mails[2].data).unwrap();
    assert_eq!(parsed.headers.get_first_value("Subject").unwrap(), "欠席連絡");
    assert_eq!(
        parsed.subparts[0].get_body().unwrap().trim_end(),
        "明後日から欠席します"
    );

    let sessions = store.sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].count("EHLO"), 1);
    assert_eq!(sessions[0].count("MAIL"), 3);
    assert_eq!(sessions[0].count("QUIT"), 1);
}

#[tokio::test]
async fn test_batch_stops_at_first_failure() {
    let (config, store) = start(CaptureOptions::default().reject("nobody@x.com")).await;

    let batch = [
        outgoing("a@x.com", "b@x.com", "First", "delivered"),
        outgoing("a@x.com", "nobody@x.com", "Second", "refused"),
        outgoing("a@x.com", "c@x.com", "Third", "never attempted"),
    ];
    let error = deliver(&config, &batch).await.unwrap_err();
    assert!(matches!(error, TransportError::RecipientsRefused(_)));

    let mails = store.mails().await;
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].subject().as_deref(), Some("First"));
    let sessions = store.sessions().await;
    assert_eq!(sessions[0].count("MAIL"), 2);
    assert_eq!(sessions[0].count("QUIT"), 1);
}

#[tokio::test]
async fn test_envelope_independent_from_headers() {
    let (config, store) = start(CaptureOptions::default()).await;

    let message = Message::builder()
        .from("Visible <visible@x.com>")
        .to("shown@x.com")
        .subject("Envelope")
        .body("routing differs")
        .build()
        .unwrap();
    let envelope = Envelope::new("bounce@x.com", ["hidden@x.com"]);
    deliver(&config, &[Outgoing::new(envelope, message.to_wire())])
        .await
        .unwrap();

    let mails = store.mails().await;
    assert_eq!(mails[0].envelope_from, "bounce@x.com");
    assert_eq!(mails[0].envelope_to, vec!["hidden@x.com"]);
    let parsed = parse_mail(&mails[0].data).unwrap();
    assert_eq!(
        parsed.headers.get_first_value("To").unwrap(),
        "shown@x.com"
    );
}

#[tokio::test]
async fn test_attachments_survive_transport() {
    let (config, store) = start(CaptureOptions::default()).await;

    let temp_dir = TempDir::new().unwrap();
    let nested = temp_dir.path().join("deeply").join("nested");
    fs::create_dir_all(&nested).unwrap();
    let text_path = nested.join("file.txt");
    fs::write(&text_path, "first line\n.second line starts with a dot\n").unwrap();
    let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    let binary_path = temp_dir.path().join("タイトルなし.png");
    fs::write(&binary_path, &binary).unwrap();

    let message = Message::builder()
        .from("sender@example.com")
        .to("recipient@example.com")
        .subject("Attachments")
        .body("see attached")
        .attach_file(&text_path)
        .attach_file(temp_dir.path().join("missing.txt"))
        .attach_file(&binary_path)
        .build()
        .unwrap();
    assert_eq!(message.attachments().len(), 2);
    assert_eq!(message.skipped().len(), 1);

    deliver(&config, &[Outgoing::from(&message)]).await.unwrap();

    let mails = store.mails().await;
    let parsed = parse_mail(&mails[0].data).unwrap();
    assert_eq!(parsed.subparts.len(), 3);

    let text_part = &parsed.subparts[1];
    assert_eq!(
        text_part.get_body_raw().unwrap(),
        b"first line\n.second line starts with a dot\n"
    );
    assert_eq!(
        text_part
            .get_content_disposition()
            .params
            .get("filename")
            .map(String::as_str),
        Some("file.txt")
    );

    let binary_part = &parsed.subparts[2];
    assert_eq!(binary_part.get_body_raw().unwrap(), binary);
    assert_eq!(binary_part.ctype.mimetype, "application/octet-stream");
}

#[tokio::test]
async fn test_injected_envelope_never_reaches_server() {
    let (config, store) = start(CaptureOptions::default()).await;

    let valid = outgoing("a@x.com", "b@x.com", "First", "accepted");
    let injected = Outgoing::new(
        Envelope::new("a@x.com>\r\nRCPT TO:<injected@x.com", ["b@x.com"]),
        valid.wire.clone(),
    );
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(10),
        deliver(&config, &[valid, injected]),
    )
    .await
    .expect("delivery must not hang");
    let error = result.unwrap_err();
    assert!(matches!(error, TransportError::InvalidAddress(_)));
    assert_eq!(error.kind(), FailureKind::Delivery);

    let mails = store.mails().await;
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].envelope_to, vec!["b@x.com"]);
    let sessions = store.sessions().await;
    assert_eq!(
        sessions[0].verbs(),
        vec!["EHLO", "MAIL", "RCPT", "DATA", "QUIT"]
    );
    assert!(sessions[0]
        .commands
        .iter()
        .all(|command| !command.line.contains("injected")));
}

#[tokio::test]
async fn test_empty_envelope_recipients() {
    let (config, store) = start(CaptureOptions::default()).await;

    let message = Message::builder()
        .from("a@x.com")
        .to("b@x.com")
        .build()
        .unwrap();
    let batch = [Outgoing::new(
        Envelope::new("a@x.com", Vec::<String>::new()),
        message.to_wire(),
    )];
    let error = deliver(&config, &batch).await.unwrap_err();
    assert!(matches!(error, TransportError::NoRecipients));

    let sessions = store.sessions().await;
    assert_eq!(sessions[0].verbs(), vec!["EHLO", "QUIT"]);
}
