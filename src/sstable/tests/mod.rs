mod tests_find;
