//! The offload primitive. The accelerator is opaque: it takes a packed input buffer and
//! fills a packed output buffer, and everything around that call lives on the host.
use crate::error::Result;
use std::path::Path;

/// The four calls of the offload library, in the order a session makes them.
pub trait Accelerator {
    fn init_parameters(&mut self, batch_size: u32, threads: u32);
    /// `network` is the overlay JSON, `layers` the layer JSON.
    fn init_accelerator(&mut self, network: &Path, layers: &Path) -> Result<()>;
    /// Blocks until the output buffer has been filled.
    fn single_inference(&mut self, input: &[u8], output: &mut [u8]) -> Result<()>;
    fn deinit_accelerator(&mut self);

    /// `single_inference` into a fresh zeroed buffer of `output_len` bytes.
    fn accelerate(&mut self, input: &[u8], output_len: usize) -> Result<Vec<u8>> {
        let mut output = vec![0u8; output_len];
        self.single_inference(input, &mut output)?;
        Ok(output)
    }
}

/// Software stand in for the offload library. The closure plays the role of the
/// accelerated layers; lifecycle calls are only counted.
pub struct FnAccelerator<F> {
    layers: F,
    pub parameters: Option<(u32, u32)>,
    pub n_inits: usize,
    pub n_inferences: usize,
    pub n_deinits: usize,
}

impl<F: FnMut(&[u8], &mut [u8])> FnAccelerator<F> {
    pub fn new(layers: F) -> Self {
        FnAccelerator {
            layers,
            parameters: None,
            n_inits: 0,
            n_inferences: 0,
            n_deinits: 0,
        }
    }
}

/// Copies the input into the front of the output, zeroing the rest.
pub fn loopback() -> FnAccelerator<impl FnMut(&[u8], &mut [u8])> {
    FnAccelerator::new(|input: &[u8], output: &mut [u8]| {
        output.iter_mut().for_each(|b| *b = 0);
        let n = input.len().min(output.len());
        output[..n].copy_from_slice(&input[..n]);
    })
}

impl<F: FnMut(&[u8], &mut [u8])> Accelerator for FnAccelerator<F> {
    fn init_parameters(&mut self, batch_size: u32, threads: u32) {
        self.parameters = Some((batch_size, threads));
    }
    fn init_accelerator(&mut self, _network: &Path, _layers: &Path) -> Result<()> {
        self.n_inits += 1;
        Ok(())
    }
    fn single_inference(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
        self.n_inferences += 1;
        (self.layers)(input, output);
        Ok(())
    }
    fn deinit_accelerator(&mut self) {
        self.n_deinits += 1;
    }
}

#[cfg(feature = "native")]
pub use self::native::NativeAccelerator;

#[cfg(feature = "native")]
mod native {
    use super::Accelerator;
    use crate::error::{QnnError, Result};
    use std::ffi::CString;
    use std::os::raw::{c_char, c_uint};
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[link(name = "qnn_offload")]
    extern "C" {
        #[link_name = "initParameters"]
        fn init_parameters(batch: c_uint, threads: c_uint);
        #[link_name = "initAccelerator"]
        fn init_accelerator(network_json: *const c_char, layer_json: *const c_char);
        #[link_name = "singleInference"]
        fn single_inference(input: *mut c_char, in_size: usize, output: *mut c_char, out_size: usize);
        #[link_name = "deinitAccelerator"]
        fn deinit_accelerator();
    }

    // the library keeps its buffers in globals, so only one handle may exist at a time
    static CLAIMED: AtomicBool = AtomicBool::new(false);

    /// Handle on the linked offload library.
    pub struct NativeAccelerator {
        _claim: (),
    }

    impl NativeAccelerator {
        pub fn claim() -> Result<Self> {
            CLAIMED
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| {
                    QnnError::ResourceUnavailable("offload library is already claimed".to_string())
                })?;
            Ok(NativeAccelerator { _claim: () })
        }
    }

    impl Drop for NativeAccelerator {
        fn drop(&mut self) {
            CLAIMED.store(false, Ordering::Release);
        }
    }

    fn c_path(path: &Path) -> Result<CString> {
        let s = path
            .to_str()
            .ok_or_else(|| QnnError::ResourceUnavailable(format!("{:?} is not valid UTF-8", path)))?;
        CString::new(s).map_err(|_| QnnError::ResourceUnavailable(format!("{:?} contains a NUL byte", path)))
    }

    impl Accelerator for NativeAccelerator {
        fn init_parameters(&mut self, batch_size: u32, threads: u32) {
            unsafe { init_parameters(batch_size, threads) }
        }
        fn init_accelerator(&mut self, network: &Path, layers: &Path) -> Result<()> {
            let network = c_path(network)?;
            let layers = c_path(layers)?;
            unsafe { init_accelerator(network.as_ptr(), layers.as_ptr()) }
            Ok(())
        }
        fn single_inference(&mut self, input: &[u8], output: &mut [u8]) -> Result<()> {
            // the input pointer is not written through, the C signature is just not const
            unsafe {
                single_inference(
                    input.as_ptr() as *mut c_char,
                    input.len(),
                    output.as_mut_ptr() as *mut c_char,
                    output.len(),
                )
            }
            Ok(())
        }
        fn deinit_accelerator(&mut self) {
            unsafe { deinit_accelerator() }
        }
    }
}
