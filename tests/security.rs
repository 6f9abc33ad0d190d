//! TLS and certauth stacks, including the accepter's certificate hook.

use gensio::addr::FilterKind;
use gensio::{Aux, ControlOp, Gensio, GensioError, StreamState};

mod common;
use common::{certs, pair, start_accepter, Certs, Recorder};

fn tls_server(c: &Certs, extra: &str) -> String {
    format!("ssl(key={},cert={}{extra}),tcp,localhost,0", c.server_key, c.server_cert)
}

/// The client either fails its open or sees the stream die right after.
async fn expect_rejected(spec: &str, selector: &gensio::Selector) {
    let rec = Recorder::new();
    let io = Gensio::new(spec, selector, Some(rec.clone())).unwrap();
    match io.open_s().await {
        Err(_) => assert_eq!(io.state(), StreamState::Closed),
        Ok(()) => {
            io.read_cb_enable(true);
            rec.wait_error().await;
            io.close_s().await.unwrap();
        }
    }
}

#[tokio::test]
async fn ssl_client_sees_server_name() {
    let c = certs();
    let p = pair(&tls_server(&c, ""), |port| {
        format!("ssl(CA={}),tcp,localhost,{port}", c.server_cert)
    })
    .await;
    assert!(p.client.is_encrypted());
    assert!(p.client.is_authenticated());
    assert!(!p.server.is_authenticated());

    let name = p.client.control(0, true, ControlOp::GetPeerCertName, "-1,CN").unwrap();
    assert!(name.ends_with(",CN=ser2net.org"), "{name}");
    let pem = p.client.control(0, true, ControlOp::Cert, "").unwrap();
    assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
    assert!(matches!(
        p.server.control(0, true, ControlOp::GetPeerCertName, "-1,CN"),
        Err(GensioError::NotReady)
    ));

    let data = common::payload(40_000);
    p.client.write_s(&data, &Aux::default()).await.unwrap();
    assert_eq!(p.server_rec.wait_data(data.len()).await, data);
    p.server.write_s(b"reply", &Aux::default()).await.unwrap();
    assert_eq!(p.client_rec.wait_data(5).await, b"reply");
    p.close().await;
}

#[tokio::test]
async fn ssl_trusts_the_ca_not_the_host_name() {
    let c = certs();
    let san = rcgen::Ia5String::try_from("ser2net.org").unwrap();
    let (cert, key) = common::self_signed_with(&c.dir, "named", "ser2net.org", vec![rcgen::SanType::DnsName(san)]);
    let p = pair(&format!("ssl(key={key},cert={cert}),tcp,localhost,0"), |port| {
        format!("ssl(CA={cert}),tcp,localhost,{port}")
    })
    .await;
    let name = p.client.control(0, true, ControlOp::GetPeerCertName, "-1,CN").unwrap();
    assert!(name.ends_with(",CN=ser2net.org"), "{name}");

    p.client.write_s(b"no name check", &Aux::default()).await.unwrap();
    assert_eq!(p.server_rec.wait_data(13).await, b"no name check");
    p.close().await;
}

#[tokio::test]
async fn ssl_untrusted_server_rejected() {
    let c = certs();
    let (sel, acc, incoming) = start_accepter(&tls_server(&c, "")).await;
    let port = acc.local_port().unwrap();
    let io = Gensio::new(&format!("ssl(CA={}),tcp,localhost,{port}", c.rogue_cert), &sel, None).unwrap();
    assert!(io.open_s().await.is_err());
    incoming.next_log().await;
    assert_eq!(incoming.pending(), 0);
    acc.shutdown().await;
}

#[tokio::test]
async fn ssl_clientauth_requires_a_certificate() {
    let c = certs();
    let extra = format!(",CA={},clientauth", c.client_cert);
    let (sel, acc, incoming) = start_accepter(&tls_server(&c, &extra)).await;
    let port = acc.local_port().unwrap();

    expect_rejected(&format!("ssl(CA={}),tcp,localhost,{port}", c.server_cert), &sel).await;
    let log = incoming.next_log().await;
    assert!(log.contains("127.0.0.1") || log.contains("::1"), "{log}");
    assert_eq!(incoming.pending(), 0);
    acc.shutdown().await;
}

#[tokio::test]
async fn ssl_clientauth_with_certificate() {
    let c = certs();
    let extra = format!(",CA={},clientauth", c.client_cert);
    let p = pair(&tls_server(&c, &extra), |port| {
        format!(
            "ssl(CA={},cert={},key={}),tcp,localhost,{port}",
            c.server_cert, c.client_cert, c.client_key
        )
    })
    .await;
    assert!(p.server.is_authenticated());
    let name = p.server.control(0, true, ControlOp::GetPeerCertName, "-1,CN").unwrap();
    assert!(name.ends_with(",CN=gensio.org"), "{name}");
    p.close().await;
}

#[tokio::test]
async fn precert_hook_supplies_the_ca() {
    let c = certs();
    let (sel, acc, incoming) = start_accepter(&tls_server(&c, ",clientauth")).await;
    let ca = c.client_cert.clone();
    incoming.set_precert(move |cv| {
        assert_eq!(cv.layer(), FilterKind::Ssl);
        cv.control(false, ControlOp::CertAuth, &ca).map(|_| ())
    });
    let port = acc.local_port().unwrap();

    let client = Gensio::new(
        &format!(
            "ssl(CA={},cert={},key={}),tcp,localhost,{port}",
            c.server_cert, c.client_cert, c.client_key
        ),
        &sel,
        None,
    )
    .unwrap();
    client.open_s().await.unwrap();
    let server = incoming.next().await;
    assert_eq!(
        server.control(0, true, ControlOp::CertAuth, "").unwrap(),
        c.client_cert
    );
    client.close_s().await.unwrap();
    server.close_s().await.unwrap();

    // a rogue certificate is still refused under the hook's CA
    expect_rejected(
        &format!(
            "ssl(CA={},cert={},key={}),tcp,localhost,{port}",
            c.server_cert, c.rogue_cert, c.rogue_key
        ),
        &sel,
    )
    .await;
    incoming.next_log().await;
    acc.shutdown().await;
}

fn certauth_client(cert: &str, key: &str, user: &str, port: u16) -> String {
    format!("certauth(cert={cert},key={key},username={user}),tcp,localhost,{port}")
}

#[tokio::test]
async fn certauth_login() {
    let c = certs();
    let spec = format!("certauth(CA={}),tcp,localhost,0", c.client_cert);
    let p = pair(&spec, |port| certauth_client(&c.client_cert, &c.client_key, "minyard", port)).await;
    assert!(p.client.is_authenticated());
    assert!(p.server.is_authenticated());
    assert!(!p.client.is_encrypted());
    assert_eq!(p.server.control(0, true, ControlOp::Username, "").unwrap(), "minyard");
    let name = p.server.control(0, true, ControlOp::GetPeerCertName, "-1,CN").unwrap();
    assert!(name.ends_with(",CN=gensio.org"), "{name}");

    p.client.write_s(b"logged in", &Aux::default()).await.unwrap();
    assert_eq!(p.server_rec.wait_data(9).await, b"logged in");
    p.close().await;
}

#[tokio::test]
async fn certauth_rejects_untrusted_certificate() {
    let c = certs();
    let (sel, acc, incoming) = start_accepter(&format!("certauth(CA={}),tcp,localhost,0", c.client_cert)).await;
    let port = acc.local_port().unwrap();
    let io = Gensio::new(&certauth_client(&c.rogue_cert, &c.rogue_key, "minyard", port), &sel, None).unwrap();
    assert!(io.open_s().await.is_err());
    assert!(incoming.next_log().await.contains("not trusted"));
    assert_eq!(incoming.pending(), 0);
    acc.shutdown().await;
}

#[tokio::test]
async fn certauth_hook_checks_username() {
    let c = certs();
    let (sel, acc, incoming) = start_accepter(&format!("certauth(CA={}),tcp,localhost,0", c.client_cert)).await;
    incoming.set_precert(|cv| {
        assert_eq!(cv.layer(), FilterKind::CertAuth);
        match cv.control(true, ControlOp::Username, "")?.as_str() {
            "minyard" => Ok(()),
            other => Err(GensioError::InvalidConfig(format!("unknown user {other}"))),
        }
    });
    let port = acc.local_port().unwrap();

    let bad = Gensio::new(&certauth_client(&c.client_cert, &c.client_key, "mallory", port), &sel, None).unwrap();
    assert!(bad.open_s().await.is_err());
    assert!(incoming.next_log().await.contains("mallory"));

    let good = Gensio::new(&certauth_client(&c.client_cert, &c.client_key, "minyard", port), &sel, None).unwrap();
    good.open_s().await.unwrap();
    let server = incoming.next().await;
    good.close_s().await.unwrap();
    server.close_s().await.unwrap();
    acc.shutdown().await;
}

#[tokio::test]
async fn certauth_over_ssl() {
    let c = certs();
    let server = format!(
        "certauth(CA={}),ssl(key={},cert={}),tcp,localhost,0",
        c.client_cert, c.server_key, c.server_cert
    );
    let p = pair(&server, |port| {
        format!(
            "certauth(cert={},key={},username=minyard),ssl(CA={}),tcp,localhost,{port}",
            c.client_cert, c.client_key, c.server_cert
        )
    })
    .await;
    assert!(p.client.is_encrypted());
    assert!(p.server.is_authenticated());
    assert_eq!(p.client.get_type(1), Some("ssl"));
    // depth 1 reaches the tls layer under certauth
    let name = p.client.control(1, true, ControlOp::GetPeerCertName, "-1,CN").unwrap();
    assert!(name.ends_with(",CN=ser2net.org"));

    p.server.write_s(b"secure", &Aux::default()).await.unwrap();
    assert_eq!(p.client_rec.wait_data(6).await, b"secure");
    p.close().await;
}
