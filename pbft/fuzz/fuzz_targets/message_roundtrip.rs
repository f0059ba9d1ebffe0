#![no_main]

use arbitrary::Arbitrary;
use commonware_codec::{Decode, Encode, EncodeSize};
use commonware_pbft::types::{Limits, Message};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    max_request_size: u16,
    max_entries: u8,
    data: Vec<u8>,
}

fn fuzz(input: FuzzInput) {
    let limits = Limits {
        max_request_size: input.max_request_size as usize,
        max_entries: input.max_entries as usize,
    };
    let Ok(message) = Message::decode_cfg(input.data.as_slice(), &limits) else {
        return;
    };
    let encoded = message.encode();
    assert_eq!(encoded.len(), message.encode_size());
    assert_eq!(encoded.as_ref(), input.data.as_slice());
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
