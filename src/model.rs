pub mod detector;
pub mod head;
pub mod resnet;
