pub mod support;

mod assembly_tests;
