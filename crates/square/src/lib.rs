pub mod error;
pub mod payments;
pub mod shipping;

pub use error::{ProviderErrorDetail, SquareError};
pub use payments::{
    CreatePaymentRequest, Money, Payment, PaymentsClient, DEFAULT_SQUARE_VERSION,
};
pub use shipping::{
    Address, ShippingClient, ShippingItem, ShippingQuote, ShippingRate, ShippingRateRequest,
};
