
mod orchestrator_tests;
mod resource_tests;
