use bytes::BytesMut;
use courier_protocol::{
	DEFAULT_MAX_FRAME_SIZE, Delivery, FramingError, Reply, ServerFrame, WireEnvelope, decode_frame, encode_frame,
	encode_frame_default, encode_frame_into, frame_len_from_payload_len, msg_type, try_decode_frame_from_buffer,
};
use proptest::prelude::*;

fn chat(from: &str, to: &str, content: &str) -> WireEnvelope {
	WireEnvelope {
		msg_type: msg_type::CHAT,
		from: from.to_string(),
		to: Some(to.to_string()),
		content: Some(content.to_string()),
	}
}

#[test]
fn encode_decode_envelope_slice() {
	let msg = chat("tok", "bob", "hello");

	let frame = encode_frame(&msg, DEFAULT_MAX_FRAME_SIZE).expect("encode_frame");
	let (decoded, consumed) = decode_frame::<WireEnvelope>(&frame, DEFAULT_MAX_FRAME_SIZE).expect("decode_frame");

	assert_eq!(consumed, frame.len());
	assert_eq!(decoded, msg);
}

#[test]
fn payload_is_camel_case_json() {
	let frame = encode_frame_default(&chat("tok", "bob", "hi")).expect("encode");
	let payload: serde_json::Value = serde_json::from_slice(&frame[4..]).expect("json");

	assert_eq!(payload["msgType"], 1);
	assert_eq!(payload["to"], "bob");
	assert_eq!(frame_len_from_payload_len(frame.len() - 4), frame.len());
}

#[test]
fn try_decode_from_buffer_incremental() {
	let msg = chat("tok", "carol", "hello");
	let frame = encode_frame_default(&msg).expect("encode");

	let mut buf = BytesMut::new();

	buf.extend_from_slice(&frame[..2]);
	assert!(
		try_decode_frame_from_buffer::<WireEnvelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[2..8]);
	assert!(
		try_decode_frame_from_buffer::<WireEnvelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
			.expect("ok")
			.is_none()
	);

	buf.extend_from_slice(&frame[8..]);
	let decoded = try_decode_frame_from_buffer::<WireEnvelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE)
		.expect("ok")
		.expect("some");

	assert_eq!(decoded, msg);
	assert!(buf.is_empty());
}

#[test]
fn mixed_server_frames_decode_in_order() {
	let delivery = Delivery {
		from: "alice".parse().expect("identity"),
		content: "hi".into(),
	};

	let mut buf = BytesMut::new();
	buf.extend_from_slice(b"prefix-");

	encode_frame_into(&mut buf, &Reply::ok("delivered"), DEFAULT_MAX_FRAME_SIZE).expect("reply");
	encode_frame_into(&mut buf, &delivery, DEFAULT_MAX_FRAME_SIZE).expect("delivery");

	let total = buf.to_vec();
	let framed = &total[b"prefix-".len()..];

	let (first, used1) = decode_frame::<ServerFrame>(framed, DEFAULT_MAX_FRAME_SIZE).expect("decode first");
	assert_eq!(first, ServerFrame::Reply(Reply::ok("delivered")));

	let (second, used2) = decode_frame::<ServerFrame>(&framed[used1..], DEFAULT_MAX_FRAME_SIZE).expect("decode second");
	assert_eq!(second, ServerFrame::Delivery(delivery));

	assert_eq!(used1 + used2, framed.len());
}

#[test]
fn decode_rejects_too_large_prefix() {
	let mut buf = BytesMut::new();
	buf.extend_from_slice(&(DEFAULT_MAX_FRAME_SIZE as u32 + 1).to_be_bytes());

	let err = try_decode_frame_from_buffer::<WireEnvelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	match err {
		FramingError::FrameTooLarge { .. } => {}
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn non_envelope_json_is_a_decode_error() {
	let frame = encode_frame_default(&serde_json::json!({ "hello": "world" })).expect("encode");
	let err = decode_frame::<WireEnvelope>(&frame, DEFAULT_MAX_FRAME_SIZE).unwrap_err();
	assert!(matches!(err, FramingError::Json(_)));
}

proptest! {
	#[test]
	fn arbitrary_split_points_decode_every_frame(
		contents in proptest::collection::vec(".{0,64}", 1..6),
		chunk in 1usize..17,
	) {
		let msgs: Vec<WireEnvelope> = contents.iter().map(|c| chat("tok", "bob", c)).collect();
		let mut wire = Vec::new();
		for m in &msgs {
			wire.extend(encode_frame_default(m).expect("encode"));
		}

		let mut buf = BytesMut::new();
		let mut out = Vec::new();
		for piece in wire.chunks(chunk) {
			buf.extend_from_slice(piece);
			while let Some(m) = try_decode_frame_from_buffer::<WireEnvelope>(&mut buf, DEFAULT_MAX_FRAME_SIZE).expect("decode") {
				out.push(m);
			}
		}

		prop_assert_eq!(out, msgs);
		prop_assert!(buf.is_empty());
	}
}
