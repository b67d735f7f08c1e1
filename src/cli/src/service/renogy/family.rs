use std::fmt::Display;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::frame;
use super::span::*;

/// Bluetooth module generation fitted to a controller.
#[derive(
  Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Family {
  Bt1,
  Bt2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Framing {
  pub(crate) device_id: u8,
  pub(crate) max_quantity: Quantity,
  pub(crate) write_service: Uuid,
  pub(crate) write: Uuid,
  pub(crate) notify_service: Uuid,
  pub(crate) notify: Uuid,
}

const BROADCAST_DEVICE_ID: u8 = 0xFF;

const BT1_UART_SERVICE: Uuid =
  uuid::uuid!("0000ffe0-0000-1000-8000-00805f9b34fb");
const BT1_UART: Uuid = uuid::uuid!("0000ffe1-0000-1000-8000-00805f9b34fb");

const BT2_WRITE_SERVICE: Uuid =
  uuid::uuid!("0000ffd0-0000-1000-8000-00805f9b34fb");
const BT2_WRITE: Uuid = uuid::uuid!("0000ffd1-0000-1000-8000-00805f9b34fb");
const BT2_NOTIFY_SERVICE: Uuid =
  uuid::uuid!("0000fff0-0000-1000-8000-00805f9b34fb");
const BT2_NOTIFY: Uuid = uuid::uuid!("0000fff1-0000-1000-8000-00805f9b34fb");

impl Family {
  pub(crate) fn framing(self) -> Framing {
    match self {
      Family::Bt1 => Framing {
        device_id: BROADCAST_DEVICE_ID,
        max_quantity: 16,
        write_service: BT1_UART_SERVICE,
        write: BT1_UART,
        notify_service: BT1_UART_SERVICE,
        notify: BT1_UART,
      },
      Family::Bt2 => Framing {
        device_id: BROADCAST_DEVICE_ID,
        max_quantity: 125,
        write_service: BT2_WRITE_SERVICE,
        write: BT2_WRITE,
        notify_service: BT2_NOTIFY_SERVICE,
        notify: BT2_NOTIFY,
      },
    }
  }

  /// Request frames covering `span`, in address order.
  pub(crate) fn requests<TSpan: Span>(
    self,
    span: TSpan,
  ) -> Vec<(SimpleSpan, Vec<u8>)> {
    let framing = self.framing();
    split_span(span, framing.max_quantity)
      .into_iter()
      .map(|span| (span, frame::request(framing.device_id, span)))
      .collect()
  }
}

impl Display for Family {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Family::Bt1 => write!(f, "BT-1"),
      Family::Bt2 => write!(f, "BT-2"),
    }
  }
}
