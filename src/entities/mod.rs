pub mod cart;
pub mod cart_item;
pub mod guest_cart_merge;
pub mod order;
pub mod order_item;
pub mod product_variant;
pub mod replacement_request;
pub mod return_request;
