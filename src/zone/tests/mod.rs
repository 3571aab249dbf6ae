mod tests_allocator;
