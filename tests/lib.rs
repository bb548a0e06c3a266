extern crate golden_gate;
extern crate pnet;

#[cfg(all(test, feature = "integration-tests"))]
mod gattlink;


#[cfg(all(test, feature = "integration-tests"))]
mod stack;
