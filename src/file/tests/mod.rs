mod tests_views;
