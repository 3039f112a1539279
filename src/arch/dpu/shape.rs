use crate::check;
use crate::error::{DpuError, Result};

/// Per-axis extents plus the row-major strides derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeDescriptor {
  dims: Vec<usize>,
  cod: Vec<usize>,
}

impl ShapeDescriptor {
  pub fn new(dims: &[usize]) -> Self {
    let mut cod = vec![1; dims.len()];
    for i in (0..dims.len().saturating_sub(1)).rev() {
      cod[i] = cod[i + 1] * dims[i + 1];
    }
    Self { dims: dims.to_vec(), cod }
  }

  pub fn dims(&self) -> &[usize] {
    &self.dims
  }

  pub fn strides(&self) -> &[usize] {
    &self.cod
  }

  pub fn rank(&self) -> usize {
    self.dims.len()
  }

  pub fn num_elements(&self) -> usize {
    self.dims.iter().product()
  }

  pub fn coord_to_position(&self, coord: &[usize]) -> Result<usize> {
    check!(
      coord.len() == self.dims.len(),
      DpuError::range(format!("coordinate rank {} against shape {:?}", coord.len(), self.dims))
    );
    let mut pos = 0;
    for (axis, (&c, &d)) in coord.iter().zip(&self.dims).enumerate() {
      check!(
        c < d,
        DpuError::range(format!("coordinate {:?} axis {} beyond shape {:?}", coord, axis, self.dims))
      );
      pos += c * self.cod[axis];
    }
    Ok(pos)
  }

  /// Unchecked `coord . strides`, for inner loops whose bounds already hold.
  pub fn offset(&self, coord: &[usize]) -> usize {
    coord.iter().zip(&self.cod).map(|(c, s)| c * s).sum()
  }

  pub fn position_to_coord(&self, pos: usize) -> Result<Vec<usize>> {
    check!(
      pos < self.num_elements(),
      DpuError::range(format!("position {} beyond shape {:?}", pos, self.dims))
    );
    let mut rest = pos;
    Ok(
      self
        .cod
        .iter()
        .map(|&stride| {
          let c = rest / stride;
          rest %= stride;
          c
        })
        .collect(),
    )
  }

  /// Left-pad with extent-1 axes up to `rank`.
  pub fn aligned(&self, rank: usize) -> Self {
    if self.rank() >= rank {
      return self.clone();
    }
    let mut dims = vec![1; rank - self.rank()];
    dims.extend_from_slice(&self.dims);
    Self::new(&dims)
  }

  /// Position inside this (input) shape feeding output coordinate `out`.
  /// Axes with extent 1 contribute coordinate 0.
  pub fn broadcast_position(&self, out: &[usize]) -> Result<usize> {
    let coord = self.broadcast_coord(out)?;
    self.aligned(out.len()).coord_to_position(&coord)
  }

  /// This operand's coordinate for output coordinate `out`: extent-1 axes
  /// pin to 0, missing leading axes count as extent 1.
  pub fn broadcast_coord(&self, out: &[usize]) -> Result<Vec<usize>> {
    let me = self.aligned(out.len());
    check!(
      me.rank() == out.len(),
      DpuError::range(format!("shape {:?} does not broadcast to rank {}", self.dims, out.len()))
    );
    let coord: Vec<usize> = me.dims.iter().zip(out).map(|(&d, &c)| if d == 1 { 0 } else { c }).collect();
    for (&c, &d) in coord.iter().zip(&me.dims) {
      check!(c < d, DpuError::range(format!("coordinate {:?} outside {:?}", out, me.dims)));
    }
    Ok(coord)
  }

  /// Output shape of broadcasting `a` against `b`.
  pub fn broadcast(a: &Self, b: &Self) -> Result<Self> {
    let rank = a.rank().max(b.rank());
    let (a, b) = (a.aligned(rank), b.aligned(rank));
    let mut dims = Vec::with_capacity(rank);
    for (&x, &y) in a.dims.iter().zip(&b.dims) {
      check!(
        x == y || x == 1 || y == 1,
        DpuError::param(format!("shapes {:?} and {:?} do not broadcast", a.dims, b.dims))
      );
      dims.push(x.max(y));
    }
    Ok(Self::new(&dims))
  }

  /// Operand coordinates for a batched matmul output coordinate `out`
  /// (`[.., m, n]`) at contraction index `k`.
  pub fn matmul_coords(out: &[usize], k: usize) -> Result<(Vec<usize>, Vec<usize>)> {
    check!(
      out.len() >= 2,
      DpuError::range(format!("matmul output coordinate {:?} needs rank >= 2", out))
    );
    let r = out.len();
    let mut lhs = out.to_vec();
    lhs[r - 1] = k;
    let mut rhs = out.to_vec();
    rhs[r - 2] = k;
    Ok((lhs, rhs))
  }
}

/// One owned flat buffer addressed through its descriptor.
#[derive(Debug, Clone)]
pub struct Tensor<T> {
  shape: ShapeDescriptor,
  data: Vec<T>,
}

impl<T: Copy + Default> Tensor<T> {
  pub fn zeros(dims: &[usize]) -> Self {
    let shape = ShapeDescriptor::new(dims);
    let data = vec![T::default(); shape.num_elements()];
    Self { shape, data }
  }

  pub fn filled(dims: &[usize], value: T) -> Self {
    let shape = ShapeDescriptor::new(dims);
    let data = vec![value; shape.num_elements()];
    Self { shape, data }
  }

  pub fn shape(&self) -> &ShapeDescriptor {
    &self.shape
  }

  pub fn data(&self) -> &[T] {
    &self.data
  }

  pub fn data_mut(&mut self) -> &mut [T] {
    &mut self.data
  }

  pub fn get(&self, coord: &[usize]) -> Result<T> {
    Ok(self.data[self.shape.coord_to_position(coord)?])
  }

  pub fn set(&mut self, coord: &[usize], value: T) -> Result<()> {
    let pos = self.shape.coord_to_position(coord)?;
    self.data[pos] = value;
    Ok(())
  }

  pub fn pos(&self, coord: &[usize]) -> Result<usize> {
    self.shape.coord_to_position(coord)
  }

  pub fn len(&self) -> usize {
    self.data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.data.is_empty()
  }
}

/// Elementwise combine of two tensors under broadcasting.
pub fn broadcast_zip<T, U, F>(a: &Tensor<T>, b: &Tensor<T>, mut f: F) -> Result<Tensor<U>>
where
  T: Copy + Default,
  U: Copy + Default,
  F: FnMut(T, T) -> U,
{
  let out = ShapeDescriptor::broadcast(a.shape(), b.shape())?;
  let mut t = Tensor::zeros(out.dims());
  for pos in 0..out.num_elements() {
    let coord = out.position_to_coord(pos)?;
    let x = a.data[a.shape.broadcast_position(&coord)?];
    let y = b.data[b.shape.broadcast_position(&coord)?];
    t.data[pos] = f(x, y);
  }
  Ok(t)
}
