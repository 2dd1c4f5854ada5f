pub mod fixtures;

#[cfg(test)]
mod app_tests;
#[cfg(test)]
mod auth_tests;
#[cfg(test)]
mod call_tests;
#[cfg(test)]
mod translation_tests;
