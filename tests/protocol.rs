//! Integration tests for the wire protocol: framing over a real socket pair
//! and the request/response model.

use std::os::unix::net::UnixStream;

use porto::error::ErrorKind;
use porto::protocol::{read_frame, write_frame, Request, Response};

#[test]
fn frames_cross_a_socket() {
    let (mut client, mut server) = UnixStream::pair().unwrap();

    let handle = std::thread::spawn(move || {
        let request: Request = read_frame(&mut server).unwrap().unwrap();
        assert_eq!(
            request,
            Request::GetData {
                name: "a".to_string(),
                data: "state".to_string(),
            }
        );
        write_frame(&mut server, &Response::value("running")).unwrap();
        let next: Option<Request> = read_frame(&mut server).unwrap();
        assert!(next.is_none());
    });

    write_frame(
        &mut client,
        &Request::GetData {
            name: "a".to_string(),
            data: "state".to_string(),
        },
    )
    .unwrap();
    let response: Response = read_frame(&mut client).unwrap().unwrap();
    assert_eq!(response.error, 0);
    assert_eq!(response.value.as_deref(), Some("running"));

    drop(client);
    handle.join().unwrap();
}

#[test]
fn every_verb_survives_encoding() {
    let requests = vec![
        Request::List,
        Request::Plist,
        Request::Dlist,
        Request::ListVolumes,
        Request::ListLayers,
        Request::Kill {
            name: "a".to_string(),
            signal: 9,
        },
        Request::Resume {
            name: "a".to_string(),
        },
        Request::ImportLayer {
            layer: "base".to_string(),
            tarball: "/tmp/base.tar".to_string(),
            merge: false,
        },
        Request::UnlinkVolume {
            path: "/v/auto".to_string(),
            container: "a".to_string(),
        },
        Request::Raw {
            request: "{\"verb\":\"list\"}".to_string(),
        },
    ];
    for request in requests {
        let mut buf = vec![];
        write_frame(&mut buf, &request).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded: Request = read_frame(&mut cursor).unwrap().unwrap();
        assert_eq!(decoded, request);
    }
}

#[test]
fn error_codes_are_stable() {
    // clients depend on these numbers, they must never move
    assert_eq!(ErrorKind::Unknown.code(), 1);
    assert_eq!(ErrorKind::ContainerAlreadyExists.code(), 3);
    assert_eq!(ErrorKind::ContainerDoesNotExist.code(), 4);
    assert_eq!(ErrorKind::InvalidState.code(), 8);
    assert_eq!(ErrorKind::ResourceNotAvailable.code(), 10);
    assert_eq!(ErrorKind::Permission.code(), 11);
    assert_eq!(ErrorKind::VolumeNotFound.code(), 13);
    assert_eq!(ErrorKind::LayerNotFound.code(), 19);
    assert_eq!(ErrorKind::Queued.code(), 21);
}

#[test]
fn truncated_frames_fail_cleanly() {
    let mut buf = vec![];
    write_frame(&mut buf, &Request::List).unwrap();
    buf.truncate(buf.len() - 2);
    let mut cursor = std::io::Cursor::new(buf);
    assert!(read_frame::<_, Request>(&mut cursor).is_err());
}
