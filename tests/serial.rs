//! The serial device transport, driven through a pseudo-terminal.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd};

use gensio::serial::ops::{PARITY_EVEN, PARITY_NONE, STOPBITS_1, STOPBITS_2};
use gensio::{Aux, ControlOp, Gensio, GensioError, Selector};

mod common;
use common::{payload, Recorder, TIMEOUT};

/// Master end, slave end and slave path of a fresh pty, or `None` where
/// ptys are unavailable.
fn open_pty() -> Option<(File, OwnedFd, String)> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let mut name = [0 as libc::c_char; 128];
    // SAFETY: the out-pointers are valid for the call; termios and winsize may be null.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            name.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return None;
    }
    // SAFETY: openpty returned two fresh descriptors we now own.
    let (master, slave) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(slave)) };
    // SAFETY: openpty wrote a NUL-terminated path into name.
    let path = unsafe { std::ffi::CStr::from_ptr(name.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    Some((File::from(master), slave, path))
}

async fn read_exact_from(mut master: File, len: usize) -> (File, Vec<u8>) {
    let job = tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; len];
        master.read_exact(&mut buf).unwrap();
        (master, buf)
    });
    tokio::time::timeout(TIMEOUT, job).await.unwrap().unwrap()
}

#[tokio::test]
async fn pty_data_and_line_settings() {
    let Some((mut master, slave, path)) = open_pty() else {
        eprintln!("no pty available, skipping");
        return;
    };
    let sel = Selector::new();
    let rec = Recorder::new();
    let io = Gensio::new(&format!("serialdev,{path},9600N81,local"), &sel, Some(rec.clone())).unwrap();
    io.open_s().await.unwrap();
    drop(slave);
    assert_eq!(io.get_type(0), Some("serialdev"));
    io.read_cb_enable(true);

    let data = payload(2000);
    io.write_s(&data, &Aux::default()).await.unwrap();
    let (m, got) = read_exact_from(master, data.len()).await;
    master = m;
    assert_eq!(got, data);

    master.write_all(b"from the line").unwrap();
    assert_eq!(rec.wait_data(13).await, b"from the line");

    let sg = io.sergensio().unwrap();
    assert_eq!(sg.baud_s(0).await.unwrap(), 9600);
    assert_eq!(sg.baud_s(115_200).await.unwrap(), 115_200);
    assert_eq!(sg.datasize_s(7).await.unwrap(), 7);
    assert_eq!(sg.parity_s(PARITY_EVEN).await.unwrap(), PARITY_EVEN);
    assert_eq!(sg.parity_s(PARITY_NONE).await.unwrap(), PARITY_NONE);
    assert_eq!(sg.stopbits_s(STOPBITS_2).await.unwrap(), STOPBITS_2);
    assert_eq!(sg.stopbits_s(0).await.unwrap(), STOPBITS_2);
    assert_eq!(sg.stopbits_s(STOPBITS_1).await.unwrap(), STOPBITS_1);
    // termios only knows the standard rates
    assert!(matches!(sg.baud(12_345, None), Err(GensioError::OutOfRange(_))));

    // no signature or line-state reports on a local device
    assert!(matches!(sg.signature("x"), Err(GensioError::NotSupported)));
    assert!(matches!(
        io.control(0, true, ControlOp::LPort, ""),
        Err(GensioError::NotSupported)
    ));
    io.close_s().await.unwrap();
    drop(master);
}

#[tokio::test]
async fn pty_hangup_ends_the_stream() {
    let Some((master, slave, path)) = open_pty() else {
        return;
    };
    let sel = Selector::new();
    let rec = Recorder::new();
    let io = Gensio::new(&format!("serialdev,{path},9600N81,local"), &sel, Some(rec.clone())).unwrap();
    io.open_s().await.unwrap();
    drop(slave);
    io.read_cb_enable(true);
    drop(master);
    assert!(matches!(rec.wait_error().await, GensioError::RemoteClosed));
    io.close_s().await.unwrap();
}

#[tokio::test]
async fn missing_device_fails_open() {
    let sel = Selector::new();
    let io = Gensio::new("serialdev,/dev/does-not-exist-gensio,9600N81", &sel, None).unwrap();
    assert!(matches!(io.open_s().await, Err(GensioError::OpenFailure(_))));
}
