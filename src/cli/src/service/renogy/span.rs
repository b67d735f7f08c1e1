pub(crate) type Address = u16;
pub(crate) type Quantity = u16;

pub(crate) trait Span {
  fn address(&self) -> Address;

  fn quantity(&self) -> Quantity;
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub(crate) struct SimpleSpan {
  pub(crate) address: Address,
  pub(crate) quantity: Quantity,
}

impl Span for SimpleSpan {
  fn address(&self) -> Address {
    self.address
  }

  fn quantity(&self) -> Quantity {
    self.quantity
  }
}

impl<TSpan: Span> Span for &TSpan {
  fn address(&self) -> Address {
    (*self).address()
  }

  fn quantity(&self) -> Quantity {
    (*self).quantity()
  }
}

/// Splits a span into consecutive requests of at most `max_quantity` words.
pub(crate) fn split_span<TSpan: Span>(
  span: TSpan,
  max_quantity: Quantity,
) -> Vec<SimpleSpan> {
  let max_quantity = max_quantity.max(1);
  let end = span.address() as u32 + span.quantity() as u32;

  let mut requests = Vec::new();
  let mut address = span.address() as u32;
  while address < end {
    let quantity = (end - address).min(max_quantity as u32);
    requests.push(SimpleSpan {
      address: address as Address,
      quantity: quantity as Quantity,
    });
    address += quantity;
  }

  requests
}
