// src/message/value.rs

use crate::error::RpcError;

use std::any::{self, Any};
use std::fmt;

/// An already-decoded, type-erased value carried through a mailbox.
///
/// The mailbox never inspects values; handlers and callbacks downcast them
/// back to the concrete type they agreed on with their peers.
pub struct Value {
  inner: Box<dyn Any + Send>,
  type_name: &'static str,
}

impl Value {
  pub fn new<T: Any + Send>(value: T) -> Self {
    Self {
      inner: Box::new(value),
      type_name: any::type_name::<T>(),
    }
  }

  /// The `()` value, used by handlers that only signal completion.
  pub fn unit() -> Self {
    Self::new(())
  }

  pub fn is<T: Any>(&self) -> bool {
    self.inner.is::<T>()
  }

  /// Name of the concrete type stored, as reported by `std::any::type_name`.
  pub fn type_name(&self) -> &'static str {
    self.type_name
  }

  pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
    self.inner.downcast_ref::<T>()
  }

  /// Recovers the concrete value, handing `self` back unchanged on a type mismatch.
  pub fn downcast<T: Any>(self) -> Result<T, Value> {
    let type_name = self.type_name;
    match self.inner.downcast::<T>() {
      Ok(boxed) => Ok(*boxed),
      Err(inner) => Err(Value { inner, type_name }),
    }
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Value").field("type", &self.type_name).finish_non_exhaustive()
  }
}

/// Ordered argument list of a call.
#[derive(Debug, Default)]
pub struct Args {
  values: Vec<Value>,
}

impl Args {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push<T: Any + Send>(&mut self, value: T) {
    self.values.push(Value::new(value));
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  /// Borrows argument `index` as a `T`.
  pub fn get<T: Any>(&self, index: usize) -> Result<&T, RpcError> {
    self
      .values
      .get(index)
      .and_then(|v| v.downcast_ref::<T>())
      .ok_or(RpcError::BadArgument {
        index,
        expected: any::type_name::<T>(),
      })
  }

  /// Moves argument `index` out as a `T`, leaving `()` in its slot.
  ///
  /// On a type mismatch the argument is left in place.
  pub fn take<T: Any>(&mut self, index: usize) -> Result<T, RpcError> {
    let bad = RpcError::BadArgument {
      index,
      expected: any::type_name::<T>(),
    };
    match self.values.get(index) {
      Some(v) if v.is::<T>() => {}
      _ => return Err(bad),
    }
    let value = std::mem::replace(&mut self.values[index], Value::unit());
    value.downcast::<T>().map_err(|_| bad)
  }

  /// Moves argument `index` out untyped, leaving `()` in its slot.
  pub fn take_value(&mut self, index: usize) -> Option<Value> {
    let slot = self.values.get_mut(index)?;
    Some(std::mem::replace(slot, Value::unit()))
  }

  pub fn into_vec(self) -> Vec<Value> {
    self.values
  }
}

impl From<Vec<Value>> for Args {
  fn from(values: Vec<Value>) -> Self {
    Self { values }
  }
}

impl IntoIterator for Args {
  type Item = Value;
  type IntoIter = std::vec::IntoIter<Value>;

  fn into_iter(self) -> Self::IntoIter {
    self.values.into_iter()
  }
}

/// Builds an [`Args`] list from heterogeneous expressions.
///
/// ```
/// let args = chanrpc::args![42u32, "name".to_string()];
/// assert_eq!(args.len(), 2);
/// ```
#[macro_export]
macro_rules! args {
  () => { $crate::message::Args::new() };
  ($($value:expr),+ $(,)?) => {
    $crate::message::Args::from(vec![$($crate::message::Value::new($value)),+])
  };
}
