#![allow(dead_code)]

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parcelport_lib::{
    ParcelBuffer, ParcelDecoder, Parcelport, ParcelportConfig, ParcelportError, SendCallback,
    api::FabricAddr,
    loopback::{LoopbackConfig, LoopbackEndpoint, LoopbackFabric},
    provider::FabricEndpoint,
};

pub struct ChannelDecoder(Sender<(FabricAddr, ParcelBuffer)>);

impl ParcelDecoder for ChannelDecoder {
    fn decode(&self, source: FabricAddr, buffer: ParcelBuffer) {
        let _ = self.0.send((source, buffer));
    }
}

pub struct Node {
    pub rx: Receiver<(FabricAddr, ParcelBuffer)>,
    pub port: Parcelport,
    pub endpoint: Arc<LoopbackEndpoint>,
}

impl Node {
    pub fn start(fabric: &Arc<LoopbackFabric>, config: ParcelportConfig) -> Self {
        Self::start_with(fabric, config, LoopbackConfig::default())
    }

    pub fn start_with(
        fabric: &Arc<LoopbackFabric>,
        config: ParcelportConfig,
        loopback: LoopbackConfig,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self::start_with_decoder(fabric, config, loopback, Arc::new(ChannelDecoder(tx)), rx)
    }

    pub fn start_with_decoder(
        fabric: &Arc<LoopbackFabric>,
        config: ParcelportConfig,
        loopback: LoopbackConfig,
        decoder: Arc<dyn ParcelDecoder>,
        rx: Receiver<(FabricAddr, ParcelBuffer)>,
    ) -> Self {
        let endpoint = fabric.open_endpoint(loopback);
        let port = Parcelport::startup(config, endpoint.clone() as Arc<dyn FabricEndpoint>, decoder)
            .unwrap();
        Self { rx, port, endpoint }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }
}

pub fn test_config() -> ParcelportConfig {
    ParcelportConfig::default()
        .with_num_senders(4)
        .with_num_receivers(4)
        .with_header_size(1024)
        .with_size_classes(vec![1024, 16 << 10], vec![8, 2])
        .with_memory_copy_threshold(256)
        .with_inline_chunk_threshold(16)
}

/// Two started nodes that know each other's address.
pub fn pair(config: ParcelportConfig) -> (Arc<LoopbackFabric>, Node, Node) {
    logging_lib::init_for_tests();
    let fabric = LoopbackFabric::new();
    let a = Node::start(&fabric, config.clone());
    let b = Node::start(&fabric, config);
    connect(&a, &b);
    (fabric, a, b)
}

pub fn connect(a: &Node, b: &Node) {
    let table = [a.port.here(), b.port.here()];
    a.port.initialize_localities(&table).unwrap();
    b.port.initialize_localities(&table).unwrap();
}

pub fn drive_until(nodes: &[&Node], mut done: impl FnMut() -> bool) {
    for _ in 0..100_000 {
        if done() {
            return;
        }
        for node in nodes {
            node.port.background_work();
        }
    }
    panic!("condition not reached");
}

pub fn callback() -> (SendCallback, Receiver<Result<(), ParcelportError>>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let callback: SendCallback = Box::new(move |result| tx.send(result).map_err(|e| e.to_string()));
    (callback, rx)
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
