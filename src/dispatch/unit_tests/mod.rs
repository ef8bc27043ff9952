#[cfg(test)]
mod support;
#[cfg(test)]
mod relay_tests;
