/// Native FCS kernel.
/// Droplets diffuse through a Gaussian focal volume and emit photons at a
/// rate proportional to the local excitation intensity. Every photon lands
/// in its work-group's arrival-time histogram.
///
/// Work-items pull droplets from the shared countdown until it reaches zero.
/// Each work-item's slice of local scratch holds its RNG state in the first
/// `rng_reserved` words and buffers photon bins in the rest; the buffer is
/// flushed into global memory whenever it fills and once at the end.
use tracing::trace;

use crate::kernel::RunConstants;
use crate::launch::RNG_STATE_WORDS;
use crate::memory::DIAGNOSTIC_LEN;
use crate::params::MAX_PHOTON_RATE;
use crate::results::slot;
use crate::software::kernel::{KernelFault, NativeKernel, WorkItemCtx};
use crate::software::memory::DeviceAllocation;

pub const ENTRY_POINT: &str = "fcs";

/// Simulation time step in nanoseconds
pub const STEP_NS: u64 = 10_000;
/// Lateral 1/e² beam radius (µm)
pub const BEAM_WAIST_XY: f32 = 1.0;
/// Axial 1/e² beam radius (µm)
pub const BEAM_WAIST_Z: f32 = 5.0;
/// Diffusion coefficient (µm²/s)
pub const DIFFUSION: f32 = 100.0;
/// Half-width of the periodic simulation box, in beam waists
pub const BOX_WAISTS: f32 = 3.0;

/// Argument positions shared by both signatures.
pub mod arg {
    pub const COUNTDOWN: usize = 0;
    pub const RESULTS: usize = 1;
    pub const LOCAL_SCRATCH: usize = 2;
    pub const DIAGNOSTIC: usize = 3;
}

// ---------------------------------------------------------------------------
// RNG
// ---------------------------------------------------------------------------

/// xoshiro128++ generator, four u32 words of state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xoshiro128 {
    s: [u32; RNG_STATE_WORDS as usize],
}

impl Xoshiro128 {
    /// Independent stream `stream` derived from `seed` via splitmix64.
    pub fn seeded(seed: u64, stream: u64) -> Self {
        let mut x = seed ^ stream.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let a = splitmix64(&mut x);
        let b = splitmix64(&mut x);
        let mut s = [a as u32, (a >> 32) as u32, b as u32, (b >> 32) as u32];
        if s == [0; 4] {
            s[0] = 1;
        }
        Xoshiro128 { s }
    }

    pub fn load(words: &[u32]) -> Self {
        let mut s = [0u32; RNG_STATE_WORDS as usize];
        s.copy_from_slice(&words[..RNG_STATE_WORDS as usize]);
        Xoshiro128 { s }
    }

    pub fn store(&self, words: &mut [u32]) {
        words[..self.s.len()].copy_from_slice(&self.s);
    }

    pub fn next_u32(&mut self) -> u32 {
        let s = &mut self.s;
        let result = s[0].wrapping_add(s[3]).rotate_left(7).wrapping_add(s[0]);
        let t = s[1] << 9;
        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];
        s[2] ^= t;
        s[3] = s[3].rotate_left(11);
        result
    }

    /// Uniform in the open interval (0, 1)
    pub fn uniform(&mut self) -> f32 {
        ((self.next_u32() >> 8) as f32 + 0.5) * (1.0 / 16_777_216.0)
    }

    /// Exp(1) variate by inversion
    pub fn exponential(&mut self) -> f32 {
        -self.uniform().ln()
    }

    /// Standard normal variate (Box-Muller)
    pub fn gaussian(&mut self) -> f32 {
        let r = (-2.0 * self.uniform().ln()).sqrt();
        r * (std::f32::consts::TAU * self.uniform()).cos()
    }
}

fn splitmix64(x: &mut u64) -> u64 {
    *x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *x;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

// ---------------------------------------------------------------------------
// Droplet physics
// ---------------------------------------------------------------------------

/// Gaussian excitation profile, 1 at the focus.
pub fn intensity(p: [f32; 3]) -> f32 {
    let wxy2 = BEAM_WAIST_XY * BEAM_WAIST_XY;
    let wz2 = BEAM_WAIST_Z * BEAM_WAIST_Z;
    (-2.0 * (p[0] * p[0] + p[1] * p[1]) / wxy2 - 2.0 * p[2] * p[2] / wz2).exp()
}

/// Histogram bin of a photon arriving at `t_ns`. Requires `t_ns < end_time_ns`.
pub fn arrival_bin(t_ns: u64, c: &RunConstants) -> u32 {
    (t_ns as u128 * c.global_capacity as u128 / c.end_time_ns as u128) as u32
}

/// State of a droplet when its simulation ended.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DropletTrace {
    pub photons: u64,
    pub intensity: f32,
    /// Integrated intensity needed for the next photon
    pub cdf_photon: f32,
    /// Integrated intensity accumulated since the last photon
    pub cdf_intensity: f32,
    /// Step length in seconds
    pub dt: f32,
    pub position: [f32; 3],
}

/// Simulate one droplet from t = 0 to the end time, calling `emit` with the
/// bin of every photon.
pub fn simulate_droplet<F>(
    rng: &mut Xoshiro128,
    c: &RunConstants,
    mut emit: F,
) -> Result<DropletTrace, KernelFault>
where
    F: FnMut(u32) -> Result<(), KernelFault>,
{
    let rate = c.photons_per_intensity_per_time;
    if !rate.is_finite() || !(0.0..=MAX_PHOTON_RATE).contains(&rate) {
        return Err(KernelFault::Aborted(format!("photon rate {rate} out of range")));
    }
    let half = [
        BOX_WAISTS * BEAM_WAIST_XY,
        BOX_WAISTS * BEAM_WAIST_XY,
        BOX_WAISTS * BEAM_WAIST_Z,
    ];
    let mut pos = half.map(|h| (2.0 * rng.uniform() - 1.0) * h);
    let dt = STEP_NS as f32 * 1e-9;
    let sigma = (2.0 * DIFFUSION * dt).sqrt();

    let mut trace = DropletTrace {
        dt,
        ..DropletTrace::default()
    };
    // accumulated in f64 so a photon draw is never lost to rounding
    let mut cdf_photon = rng.exponential() as f64;
    let mut cdf_intensity = 0.0f64;
    let mut t = 0u64;
    while t < c.end_time_ns {
        let i = intensity(pos);
        cdf_intensity += (i * rate * dt) as f64;
        while cdf_intensity >= cdf_photon {
            cdf_intensity -= cdf_photon;
            cdf_photon = rng.exponential() as f64;
            emit(arrival_bin(t, c))?;
            trace.photons += 1;
        }
        for (p, h) in pos.iter_mut().zip(half) {
            *p = wrap(*p + sigma * rng.gaussian(), h);
        }
        trace.intensity = i;
        t = match t.checked_add(STEP_NS) {
            Some(next) => next,
            None => break,
        };
    }

    trace.cdf_photon = cdf_photon as f32;
    trace.cdf_intensity = cdf_intensity as f32;
    trace.position = pos;
    Ok(trace)
}

/// Periodic boundary on [-h, h]
fn wrap(p: f32, h: f32) -> f32 {
    if p > h {
        p - 2.0 * h
    } else if p < -h {
        p + 2.0 * h
    } else {
        p
    }
}

// ---------------------------------------------------------------------------
// Kernel entry
// ---------------------------------------------------------------------------

pub fn fcs_kernel() -> NativeKernel {
    NativeKernel::new(ENTRY_POINT, run_work_item)
}

fn run_work_item(ctx: &mut WorkItemCtx<'_>) -> Result<(), KernelFault> {
    let diagnostic = match ctx.arg_count() {
        4 => false,
        5 => true,
        n => {
            return Err(KernelFault::Aborted(format!(
                "{ENTRY_POINT} takes 4 or 5 arguments, got {n}"
            )));
        }
    };
    let countdown = ctx.global(arg::COUNTDOWN)?;
    let results = ctx.global(arg::RESULTS)?;
    let debug = if diagnostic {
        Some(ctx.global(arg::DIAGNOSTIC)?)
    } else {
        None
    };
    let c = ctx.constants(ctx.arg_count() - 1)?;
    let gid = ctx.global_linear_id();
    let group = ctx.group_linear_id();
    let lid = ctx.local_linear_id();

    let capacity = c.local_capacity as usize;
    let reserved = c.rng_reserved as usize;
    if reserved < RNG_STATE_WORDS as usize || reserved >= capacity {
        return Err(KernelFault::Aborted(format!(
            "rng_reserved {reserved} does not fit local capacity {capacity}"
        )));
    }
    let local = ctx.local_mut(arg::LOCAL_SCRATCH)?;
    let len = local.len();
    let start = lid * capacity;
    let mine = local
        .get_mut(start..start + capacity)
        .ok_or(KernelFault::OutOfBounds {
            what: "local scratch",
            index: start + capacity,
            len,
        })?;
    let (rng_words, photon_slots) = mine.split_at_mut(reserved);

    let mut rng = Xoshiro128::seeded(c.seed, gid);
    rng.store(rng_words);
    let base = group * c.global_capacity as usize;
    let mut filled = 0usize;
    let mut droplets = 0u64;
    let mut last = None;

    while countdown.decrement_u32(0)?.is_some() {
        let trace = simulate_droplet(&mut rng, &c, |bin| {
            photon_slots[filled] = bin;
            filled += 1;
            if filled == photon_slots.len() {
                flush(results, base, photon_slots)?;
                filled = 0;
            }
            Ok(())
        })?;
        rng.store(rng_words);
        droplets += 1;
        last = Some(trace);
    }
    flush(results, base, &photon_slots[..filled])?;
    trace!(gid, droplets, "work-item done");

    if gid == 0 {
        if let Some(debug) = debug {
            write_diagnostics(debug, countdown, &c, last)?;
        }
    }
    Ok(())
}

fn flush(results: &DeviceAllocation, base: usize, bins: &[u32]) -> Result<(), KernelFault> {
    for &bin in bins {
        results.fetch_add_u64(base + bin as usize, 1)?;
    }
    Ok(())
}

fn write_diagnostics(
    debug: &DeviceAllocation,
    countdown: &DeviceAllocation,
    c: &RunConstants,
    last: Option<DropletTrace>,
) -> Result<(), KernelFault> {
    debug.store_f32(slot::DROPLETS_REMAINING, countdown.load_u32(0)? as f32)?;
    debug.store_f32(slot::RNG_RESERVED, c.rng_reserved as f32)?;
    debug.store_f32(slot::LOCAL_SIZE, c.local_capacity as f32)?;
    debug.store_f32(slot::GLOBAL_SIZE, c.global_capacity as f32)?;
    debug.store_f32(slot::PHOTON_RATE, c.photons_per_intensity_per_time)?;
    debug.store_f32(slot::END_TIME, (c.end_time_ns as f64 * 1e-9) as f32)?;
    debug.store_f32(slot::DEBUG_SIZE, DIAGNOSTIC_LEN as f32)?;
    if let Some(t) = last {
        debug.store_f32(slot::INTENSITY, t.intensity)?;
        debug.store_f32(slot::CDF_PHOTON, t.cdf_photon)?;
        debug.store_f32(slot::CDF_INTENSITY, t.cdf_intensity)?;
        debug.store_f32(slot::DT, t.dt)?;
        debug.store_f32(slot::POSITION_X, t.position[0])?;
        debug.store_f32(slot::POSITION_Y, t.position[1])?;
        debug.store_f32(slot::POSITION_Z, t.position[2])?;
    }
    Ok(())
}
