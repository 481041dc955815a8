use ulid::Ulid;

use crate::model::{Ms, SlotState, format_rfc3339};
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Plan expired or no access credits left.
    SubscriptionExhausted,
    /// Off the grid or outside the booking horizon.
    InvalidSlot(Ms),
    UnknownInstructor(Ulid),
    UnknownMember(Ulid),
    /// Slot disabled or in a non-`Free` state.
    SlotUnavailable,
    SlotFull,
    DuplicateBooking,
    BookingNotFound(Ulid),
    Forbidden,
    /// A bulk slot change would cancel live bookings and was not confirmed.
    ConfirmationRequired { bookings: usize },
    InvalidTransition { from: SlotState, to: SlotState },
    LimitExceeded(&'static str),
    StoreUnavailable(String),
}

impl EngineError {
    /// Only store outages are worth retrying; everything else is a caller error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::SubscriptionExhausted => {
                write!(f, "subscription expired or no accesses remaining")
            }
            EngineError::InvalidSlot(t) => {
                write!(f, "{} is not a bookable slot", format_rfc3339(*t))
            }
            EngineError::UnknownInstructor(id) => write!(f, "unknown instructor: {id}"),
            EngineError::UnknownMember(id) => write!(f, "unknown member: {id}"),
            EngineError::SlotUnavailable => write!(f, "slot is not available"),
            EngineError::SlotFull => write!(f, "slot is full"),
            EngineError::DuplicateBooking => {
                write!(f, "member already has a booking at this time")
            }
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::Forbidden => write!(f, "not allowed to modify this booking"),
            EngineError::ConfirmationRequired { bookings } => write!(
                f,
                "{bookings} booking(s) exist at this time; confirm to cancel them"
            ),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "slot cannot go from {} to {}", from.label(), to.label())
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => EngineError::StoreUnavailable(msg),
            StoreError::DuplicateBooking => EngineError::DuplicateBooking,
            StoreError::UnknownMember(id) => EngineError::UnknownMember(id),
        }
    }
}
