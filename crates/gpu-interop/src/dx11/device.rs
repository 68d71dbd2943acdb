//! D3D11 device that owns the shareable surface textures.
//!
//! Holds the device and its immediate context, plus the event-query wait
//! used to make GL work on shared textures land before a frame is handed to
//! the compositor.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::*;
use windows::Win32::Graphics::Direct3D11::*;

use tracing::{debug, error};

/// A D3D11 device with BGRA support and its immediate context.
///
/// Created via [`Dx11Device::new()`], which tries hardware acceleration
/// first and falls back to WARP.
pub struct Dx11Device {
    device: ID3D11Device,
    context: ID3D11DeviceContext,
}

impl Dx11Device {
    /// Create a new D3D11 device using hardware acceleration, falling back to
    /// WARP if hardware is unavailable (e.g. CI/headless environments).
    pub fn new() -> Result<Self> {
        let mut device = None;
        let mut context = None;

        let driver_types = [D3D_DRIVER_TYPE_HARDWARE, D3D_DRIVER_TYPE_WARP];
        let mut created = false;

        for &driver_type in &driver_types {
            let hr = unsafe {
                D3D11CreateDevice(
                    None,
                    driver_type,
                    HMODULE::default(),
                    D3D11_CREATE_DEVICE_SINGLETHREADED | D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                    Some(&[D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_10_1]),
                    D3D11_SDK_VERSION,
                    Some(&mut device as *mut _),
                    None,
                    Some(&mut context as *mut _),
                )
            };
            if hr.is_ok() {
                debug!("D3D11 device created with driver type {:?}", driver_type);
                created = true;
                break;
            }
        }

        if !created {
            error!("Failed to create D3D11 device with any driver type");
            return Err(anyhow!("D3D11 is unavailable with every driver type"));
        }

        let device = device.ok_or_else(|| anyhow!("D3D11CreateDevice returned no device"))?;
        let context = context.ok_or_else(|| anyhow!("D3D11CreateDevice returned no context"))?;

        Ok(Self { device, context })
    }

    /// Borrow the underlying `ID3D11Device`.
    pub fn device(&self) -> &ID3D11Device {
        &self.device
    }

    /// Borrow the immediate device context.
    pub fn context(&self) -> &ID3D11DeviceContext {
        &self.context
    }
}

/// End `query` behind the work submitted on `context`, flush, and poll
/// until it signals or `timeout` elapses. Returns `false` on timeout.
pub fn flush_and_wait(context: &ID3D11DeviceContext, query: &ID3D11Query, timeout: Duration) -> bool {
    let start = Instant::now();
    unsafe {
        context.End(query);
        context.Flush();
        // GetData reports "not ready" as S_FALSE, which the windows crate
        // maps to Ok(()); the BOOL payload is the real signal and stays
        // zero until the query completes.
        loop {
            let mut done: u32 = 0;
            let _ = context.GetData(
                query,
                Some(&mut done as *mut u32 as *mut std::ffi::c_void),
                std::mem::size_of::<u32>() as u32,
                0,
            );
            if done != 0 {
                return true;
            }
            if start.elapsed() > timeout {
                return false;
            }
            std::thread::yield_now();
        }
    }
}

/// Create a `D3D11_QUERY_EVENT` for GPU synchronization.
pub fn create_event_query(device: &ID3D11Device) -> Result<ID3D11Query> {
    let desc = D3D11_QUERY_DESC {
        Query: D3D11_QUERY_EVENT,
        ..Default::default()
    };
    let mut query = None;
    unsafe { device.CreateQuery(&desc, Some(&mut query as *mut _)) }?;
    query.ok_or_else(|| anyhow!("CreateQuery returned no query"))
}
