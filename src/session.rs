use crate::accel::Accelerator;
use crate::bits::{pack_chw, unpack, unpack_levels, ActivationBits};
use crate::error::{QnnError, Result};
use crate::topology::{LayerTable, NetworkDescriptor};
use ndarray::{Array1, Array3};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Arguments of `init_parameters`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub batch_size: u32,
    /// 0 lets the accelerator pick.
    pub threads: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            batch_size: 1,
            threads: 0,
        }
    }
}

impl SessionConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }
    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
}

/// Descriptors loaded by `initialize`; they only exist while the accelerator is up.
#[derive(Debug, Clone)]
struct Metadata {
    network: NetworkDescriptor,
    layers: LayerTable,
}

enum State {
    Uninitialized,
    Ready(Metadata),
}

/// Owns an accelerator between its init and deinit calls, and the network metadata the
/// buffer codecs need while it is up.
///
/// All accelerator calls take `&mut self`, so at most one inference is in flight.
pub struct AcceleratorSession<A: Accelerator> {
    accel: A,
    config: SessionConfig,
    state: State,
}

impl<A: Accelerator> AcceleratorSession<A> {
    pub fn new(accel: A, config: SessionConfig) -> Self {
        AcceleratorSession {
            accel,
            config,
            state: State::Uninitialized,
        }
    }
    pub fn state(&self) -> SessionState {
        match self.state {
            State::Uninitialized => SessionState::Uninitialized,
            State::Ready(_) => SessionState::Ready,
        }
    }
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
    pub fn accelerator(&self) -> &A {
        &self.accel
    }
    fn metadata(&self) -> Result<&Metadata> {
        match &self.state {
            State::Ready(meta) => Ok(meta),
            State::Uninitialized => Err(QnnError::NotInitialized),
        }
    }
    pub fn network(&self) -> Result<&NetworkDescriptor> {
        Ok(&self.metadata()?.network)
    }
    pub fn layers(&self) -> Result<&LayerTable> {
        Ok(&self.metadata()?.layers)
    }
    pub fn activation_bits(&self) -> Result<ActivationBits> {
        self.network()?.activation_bits()
    }

    /// Load both descriptors and bring the accelerator up. Does nothing when already `Ready`.
    pub fn initialize<P: AsRef<Path>, Q: AsRef<Path>>(&mut self, network: P, layers: Q) -> Result<()> {
        if let State::Ready(_) = self.state {
            debug!("accelerator already initialized");
            return Ok(());
        }
        let (network, layers) = (network.as_ref(), layers.as_ref());
        let metadata = Metadata {
            network: NetworkDescriptor::from_file(network)?,
            layers: LayerTable::from_file(layers)?,
        };
        self.accel.init_parameters(self.config.batch_size, self.config.threads);
        self.accel.init_accelerator(network, layers)?;
        info!(
            "accelerator initialized from {:?} ({} layers, {} activations)",
            network,
            metadata.layers.len(),
            metadata.network.parameters.activation_bits
        );
        self.state = State::Ready(metadata);
        Ok(())
    }

    pub fn run_inference(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
        self.metadata()?;
        self.accel.single_inference(input, output)
    }

    /// Zeroed `(dim, dim, channels)` buffer for the accelerator to write into.
    pub fn allocate_buffer(&self, channels: usize, dim: usize) -> Result<Array3<u8>> {
        self.metadata()?;
        Ok(Array3::zeros((dim, dim, channels)))
    }

    /// Pack a `(channels, dim, dim)` tensor of levels for the accelerator.
    pub fn prepare_buffer(&self, levels: &Array3<u8>) -> Result<Vec<u8>> {
        Ok(pack_chw(levels, self.activation_bits()?))
    }

    /// Decode an accelerator output buffer holding a `(h, w, c)` feature map.
    pub fn postprocess_buffer(&self, buffer: &[u8], shape: (usize, usize, usize)) -> Result<Array1<f32>> {
        unpack(buffer, self.activation_bits()?, shape)
    }

    /// `postprocess_buffer` keeping the `(h, w, c)` levels, for host layers that need the spatial layout.
    pub fn postprocess_levels(&self, buffer: &[u8], shape: (usize, usize, usize)) -> Result<Array3<u8>> {
        unpack_levels(buffer, self.activation_bits()?, shape)
    }

    pub fn shutdown(&mut self) {
        if let State::Uninitialized = self.state {
            debug!("accelerator already shut down");
            return;
        }
        self.accel.deinit_accelerator();
        self.state = State::Uninitialized;
        info!("accelerator shut down");
    }
}

impl<A: Accelerator> Drop for AcceleratorSession<A> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
