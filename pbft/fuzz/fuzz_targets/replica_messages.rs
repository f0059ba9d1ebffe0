#![no_main]

use arbitrary::Arbitrary;
use commonware_codec::Decode;
use commonware_pbft::{
    mocks::{application::Application, mutator::Mutator},
    types::Message,
    Config, Event, Replica, Trusting,
};
use libfuzzer_sys::fuzz_target;
use rand::{rngs::StdRng, SeedableRng};
use std::time::Duration;

#[derive(Arbitrary, Debug)]
enum Input {
    /// Raw bytes decoded as a message from `from`.
    Raw { from: u8, data: Vec<u8> },

    /// A generated message from `from`, optionally corrupted.
    Generated { from: u8, mutate: bool },
}

#[derive(Arbitrary, Debug)]
struct FuzzInput {
    seed: u64,
    inputs: Vec<Input>,
}

fn config(me: u32) -> Config {
    Config {
        me,
        n: 4,
        f: 1,
        checkpoint_period: 2,
        log_multiplier: 2,
        request_timeout: Duration::from_secs(1),
        view_change_timeout: Duration::from_secs(1),
        checkpoint_timeout: Duration::from_secs(1),
        max_request_size: 64,
        max_entries: 16,
    }
}

fn fuzz(input: FuzzInput) {
    let limits = config(0).limits();
    let mut replicas = [
        Replica::new(config(0), Application::default(), Trusting).unwrap(),
        Replica::new(config(1), Application::default(), Trusting).unwrap(),
    ];
    let mut mutator = Mutator::new(StdRng::seed_from_u64(input.seed));
    let mut views = [0; 2];
    for input in input.inputs {
        let (from, message) = match input {
            Input::Raw { from, data } => match Message::decode_cfg(data.as_slice(), &limits) {
                Ok(message) => (from, message),
                Err(_) => continue,
            },
            Input::Generated { from, mutate } => {
                let mut message = mutator.message();
                if mutate {
                    mutator.mutate(&mut message);
                }
                (from, message)
            }
        };
        for (replica, view) in replicas.iter_mut().zip(views.iter_mut()) {
            replica.handle(Event::Message {
                from: from as u32,
                message: message.clone(),
            });
            assert!(replica.view() >= *view);
            *view = replica.view();
            let (low, high) = replica.watermarks();
            assert!(low <= high);
        }
    }
}

fuzz_target!(|input: FuzzInput| {
    fuzz(input);
});
