//! Identity registry: the fixed table of service identities this device
//! advertises and listens on, one per slot.
//!
//! Every slot owns three UUIDs: the advertised service, the message
//! characteristic, and the confirmation characteristic. No UUID may appear
//! twice, neither inside a slot nor across slots, so an attribute id always
//! maps back to exactly one slot.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

/// One pre-provisioned service identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IdentitySlot {
    pub slot_index: usize,
    pub service_id: Uuid,
    pub message_attr_id: Uuid,
    pub confirm_attr_id: Uuid,
}

impl IdentitySlot {
    fn uuids(&self) -> [(Uuid, &'static str); 3] {
        [
            (self.service_id, "service_id"),
            (self.message_attr_id, "message_attr_id"),
            (self.confirm_attr_id, "confirm_attr_id"),
        ]
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("identity registry has no slots")]
    Empty,
    #[error("slot index {0} is provisioned more than once")]
    DuplicateSlot(usize),
    #[error("uuid {uuid} ({field}) of slot {slot} is already used by slot {first_slot}")]
    DuplicateUuid {
        uuid: Uuid,
        field: &'static str,
        slot: usize,
        first_slot: usize,
    },
}

/// Immutable, cheaply clonable table of identity slots, ordered by slot index.
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    slots: Arc<[IdentitySlot]>,
}

impl IdentityRegistry {
    /// Validate and freeze a set of slots.
    pub fn new(mut slots: Vec<IdentitySlot>) -> Result<Self, IdentityError> {
        if slots.is_empty() {
            return Err(IdentityError::Empty);
        }
        slots.sort_by_key(|s| s.slot_index);

        let mut seen: HashMap<Uuid, usize> = HashMap::new();
        for (i, slot) in slots.iter().enumerate() {
            if i > 0 && slots[i - 1].slot_index == slot.slot_index {
                return Err(IdentityError::DuplicateSlot(slot.slot_index));
            }
            for (uuid, field) in slot.uuids() {
                if let Some(&first_slot) = seen.get(&uuid) {
                    return Err(IdentityError::DuplicateUuid {
                        uuid,
                        field,
                        slot: slot.slot_index,
                        first_slot,
                    });
                }
                seen.insert(uuid, slot.slot_index);
            }
        }

        Ok(Self {
            slots: slots.into(),
        })
    }

    /// The three slots provisioned when no configuration overrides them.
    ///
    /// Slot 0 carries the chat service's historical UUIDs.
    pub fn default_slots() -> Vec<IdentitySlot> {
        vec![
            IdentitySlot {
                slot_index: 0,
                service_id: Uuid::from_u128(0x0000e235_0000_1000_8000_00805f9b34fb),
                message_attr_id: Uuid::from_u128(0x7db3e235_3608_41f3_a03c_955fcbd2ea4b),
                confirm_attr_id: Uuid::from_u128(0x83906bca_cedd_4052_8239_ccc407b0464e),
            },
            IdentitySlot {
                slot_index: 1,
                service_id: Uuid::from_u128(0x0000bba7_0000_1000_8000_00805f9b34fb),
                message_attr_id: Uuid::from_u128(0x7db3bba7_3608_41f3_a03c_955fcbd2ea4b),
                confirm_attr_id: Uuid::from_u128(0x8390bba7_cedd_4052_8239_ccc407b0464e),
            },
            IdentitySlot {
                slot_index: 2,
                service_id: Uuid::from_u128(0x0000c41d_0000_1000_8000_00805f9b34fb),
                message_attr_id: Uuid::from_u128(0x7db3c41d_3608_41f3_a03c_955fcbd2ea4b),
                confirm_attr_id: Uuid::from_u128(0x8390c41d_cedd_4052_8239_ccc407b0464e),
            },
        ]
    }

    pub fn slots(&self) -> &[IdentitySlot] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, slot_index: usize) -> Option<&IdentitySlot> {
        self.slots.iter().find(|s| s.slot_index == slot_index)
    }

    /// Slot advertising the given service id.
    pub fn slot_for_service(&self, service_id: &Uuid) -> Option<&IdentitySlot> {
        self.slots.iter().find(|s| &s.service_id == service_id)
    }

    /// Slot owning the given message or confirmation attribute.
    pub fn slot_for_attribute(&self, attribute_id: &Uuid) -> Option<&IdentitySlot> {
        self.slots
            .iter()
            .find(|s| &s.message_attr_id == attribute_id || &s.confirm_attr_id == attribute_id)
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self {
            slots: Self::default_slots().into(),
        }
    }
}
