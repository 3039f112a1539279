//! Fixed-point shift / round / saturate kernel shared by every engine.

/// Tie-breaking policy used when a value sits exactly between two integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
  /// Nearest integer, ties away from zero.
  Standard,
  /// Ties toward +inf, also for negative values (what the datapath does).
  Hardware,
  /// Ties to the even neighbour.
  ParityEven,
}

pub const I8_MIN: i64 = i8::MIN as i64;
pub const I8_MAX: i64 = i8::MAX as i64;

pub fn round(value: f64, mode: RoundMode) -> f64 {
  let floor = value.floor();
  let is_tie = value - floor == 0.5;
  match mode {
    RoundMode::Standard => value.round(),
    RoundMode::Hardware => {
      if is_tie {
        value.ceil()
      } else {
        value.round()
      }
    },
    RoundMode::ParityEven => {
      if is_tie {
        (value * 0.5).round() * 2.0
      } else {
        value.round()
      }
    },
  }
}

pub fn saturate<T: PartialOrd>(value: T, lo: T, hi: T) -> T {
  if value > hi {
    hi
  } else if value < lo {
    lo
  } else {
    value
  }
}

/// Saturate against the raw value first, then round inside the range.
pub fn quantize(value: f64, mode: RoundMode, min: i64, max: i64) -> i64 {
  if value > max as f64 {
    max
  } else if value < min as f64 {
    min
  } else {
    saturate(round(value, mode) as i64, min, max)
  }
}

/// Default output stage of the compute engine.
pub fn dpu_round(value: f64) -> i8 {
  quantize(value, RoundMode::Hardware, I8_MIN, I8_MAX) as i8
}

/// Output stage of the normalization paths.
pub fn dpu_round_even(value: f64) -> i8 {
  quantize(value, RoundMode::ParityEven, I8_MIN, I8_MAX) as i8
}

/// Integer `n >> shift` with round-half-to-even on the dropped bits, then clamp.
///
/// The carry is taken from the highest dropped bit; on an exact half (no
/// sticky bit below it) the result is only bumped when the truncated integer
/// part is odd.
pub fn round_to_even(n: i64, shift: u32, min: i64, max: i64) -> i64 {
  if shift == 0 {
    return saturate(n, min, max);
  }
  if shift >= 63 {
    return saturate(if n < 0 { -1 } else { 0 }, min, max);
  }
  let mask: i64 = 1 << (shift - 1);
  let mut integer = n >> shift;
  if n & mask != 0 {
    let sticky = n.unsigned_abs() & (mask as u64 - 1);
    if sticky == 0 {
      if integer % 2 != 0 {
        integer += 1;
      }
    } else {
      integer += 1;
    }
  }
  saturate(integer, min, max)
}

/// Truncate an f32 to bfloat16 precision with round-to-nearest-even.
pub fn f_to_bf(data: f32) -> f32 {
  let u = data.to_bits();
  let flag = (u & 0x0001_0000) >> 16;
  let u = u.wrapping_add(0x7fff + flag) & 0xFFFF_0000;
  f32::from_bits(u)
}

/// Round half up into the int8 range, keeping the value as a float.
pub fn dr(x: f64) -> f64 {
  let r = if x - x.floor() >= 0.5 { x.ceil() } else { x.floor() };
  r.max(I8_MIN as f64).min(I8_MAX as f64)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn round_to_even_ties() {
    assert_eq!(round_to_even(0b101, 1, I8_MIN, I8_MAX), 2);
    assert_eq!(round_to_even(0b111, 1, I8_MIN, I8_MAX), 4);
    assert_eq!(round_to_even(-5, 1, I8_MIN, I8_MAX), -2);
    assert_eq!(round_to_even(6, 2, I8_MIN, I8_MAX), 2);
    assert_eq!(round_to_even(5, 2, I8_MIN, I8_MAX), 1);
    assert_eq!(round_to_even(1000, 1, I8_MIN, I8_MAX), 127);
  }

  #[test]
  fn round_modes() {
    assert_eq!(round(2.5, RoundMode::Standard), 3.0);
    assert_eq!(round(-2.5, RoundMode::Standard), -3.0);
    assert_eq!(round(-2.5, RoundMode::Hardware), -2.0);
    assert_eq!(round(2.5, RoundMode::Hardware), 3.0);
    assert_eq!(round(2.5, RoundMode::ParityEven), 2.0);
    assert_eq!(round(3.5, RoundMode::ParityEven), 4.0);
    assert_eq!(round(-3.5, RoundMode::ParityEven), -4.0);
  }

  #[test]
  fn dpu_round_saturates_before_rounding() {
    assert_eq!(dpu_round(127.6), 127);
    assert_eq!(dpu_round(-128.5), -128);
    assert_eq!(dpu_round(-1.5), -1);
    assert_eq!(dpu_round_even(-1.5), -2);
  }

  #[test]
  fn bfloat_truncation() {
    assert_eq!(f_to_bf(1.0), 1.0);
    // 1 + 2^-8 is exactly halfway between two bf16 values, ties to even
    assert_eq!(f_to_bf(1.0 + 1.0 / 256.0), 1.0);
    assert_eq!(f_to_bf(1.0 + 3.0 / 256.0), 1.0 + 4.0 / 256.0);
  }

  #[test]
  fn dr_clamps() {
    assert_eq!(dr(200.0), 127.0);
    assert_eq!(dr(-0.5), 0.0);
    assert_eq!(dr(-1.6), -2.0);
  }
}
